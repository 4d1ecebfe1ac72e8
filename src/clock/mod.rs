use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

/// Converts a wall-clock time to fractional seconds since the Unix epoch.
///
/// Times before the epoch are reported as negative seconds.
pub fn to_epoch_secs(t: SystemTime) -> f64 {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

/// Converts fractional seconds since the Unix epoch back to a wall-clock time.
pub fn from_epoch_secs(secs: f64) -> SystemTime {
    if secs.is_finite() && secs >= 0.0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs_f64(secs)
    } else {
        SystemTime::UNIX_EPOCH
    }
}

/// Formats a SystemTime as "2006-01-02 15:04:05.000" in UTC.
pub fn format_datetime(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Returns the index of the fixed-length bucket containing `t`.
///
/// Buckets are aligned to the Unix epoch, so two samples share a bucket iff
/// they fall in the same `[k * length, (k + 1) * length)` interval.
pub fn bucket_index(t: SystemTime, length: Duration) -> u64 {
    let length_secs = length.as_secs().max(1);
    let secs = t
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    secs / length_secs
}

/// Returns the start time of the bucket with the given index.
pub fn bucket_start(index: u64, length: Duration) -> SystemTime {
    let length_secs = length.as_secs().max(1);
    SystemTime::UNIX_EPOCH + Duration::from_secs(index.saturating_mul(length_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_secs_roundtrip_is_close() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_250);
        let secs = to_epoch_secs(t);
        assert!((secs - 1_700_000_000.25).abs() < 1e-6);

        let back = from_epoch_secs(secs);
        let diff = back
            .duration_since(t)
            .unwrap_or_else(|e| e.duration());
        assert!(diff < Duration::from_micros(1));
    }

    #[test]
    fn test_from_epoch_secs_rejects_garbage() {
        assert_eq!(from_epoch_secs(f64::NAN), SystemTime::UNIX_EPOCH);
        assert_eq!(from_epoch_secs(-5.0), SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn test_format_datetime() {
        assert_eq!(
            format_datetime(SystemTime::UNIX_EPOCH),
            "1970-01-01 00:00:00.000"
        );
    }

    #[test]
    fn test_bucket_boundaries() {
        let minute = Duration::from_secs(60);
        let at = |s: u64| SystemTime::UNIX_EPOCH + Duration::from_secs(s);

        assert_eq!(bucket_index(at(0), minute), 0);
        assert_eq!(bucket_index(at(59), minute), 0);
        assert_eq!(bucket_index(at(60), minute), 1);
        assert_eq!(bucket_start(1, minute), at(60));
    }
}
