use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::collector::Metric;

const CPU_USER: &str = "/sys/cpu/user";
const CPU_SYS: &str = "/sys/cpu/sys";
const MEMORY_TOTAL: &str = "/sys/memory/total";
const MEMORY_FREE: &str = "/sys/memory/free";
const FS_PREFIX: &str = "/sys/fs";
const FS_METRICS_DIR: &str = "/METRICS/";

/// Usage of one mounted file system at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct FsStats {
    pub mount_point: String,
    pub size: u64,
    pub free: u64,
}

impl FsStats {
    /// Percentage of the file system in use, or None for a zero-sized mount.
    pub fn used_percent(&self) -> Option<f64> {
        if self.size == 0 {
            return None;
        }
        let used = self.size.saturating_sub(self.free);
        Some(used as f64 * 100.0 / self.size as f64)
    }
}

/// Per-endpoint measurement derived from one metric response.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceStats {
    /// Newest metric timestamp in the response, or the sweep time.
    pub ts: SystemTime,
    pub cpu_user: Option<f64>,
    pub cpu_sys: Option<f64>,
    pub memory_total: Option<u64>,
    pub memory_free: Option<u64>,
    /// Deduplicated and ordered by mount point.
    pub fss: Vec<FsStats>,
}

impl InstanceStats {
    /// Derives stats from a metric list.
    ///
    /// Metrics whose values cannot be read as numbers are ignored. `default_ts`
    /// is used when no metric carries its own timestamp.
    pub fn from_metrics(metrics: &[Metric], default_ts: SystemTime) -> Self {
        let mut ts: Option<SystemTime> = None;
        let mut stats = Self {
            ts: default_ts,
            cpu_user: None,
            cpu_sys: None,
            memory_total: None,
            memory_free: None,
            fss: Vec::new(),
        };
        let mut partial_fss: BTreeMap<String, (Option<u64>, Option<u64>)> = BTreeMap::new();

        for metric in metrics {
            if let Some(metric_ts) = metric.timestamp {
                ts = Some(ts.map_or(metric_ts, |cur| cur.max(metric_ts)));
            }
            let Some(value) = metric.value.as_f64() else {
                continue;
            };
            match metric.path.as_str() {
                CPU_USER => stats.cpu_user = Some(value),
                CPU_SYS => stats.cpu_sys = Some(value),
                MEMORY_TOTAL => stats.memory_total = Some(to_u64(value)),
                MEMORY_FREE => stats.memory_free = Some(to_u64(value)),
                path => {
                    if let Some((mount, field)) = parse_fs_path(path) {
                        let entry = partial_fss.entry(mount).or_default();
                        match field {
                            "size" => entry.0 = Some(to_u64(value)),
                            "free" => entry.1 = Some(to_u64(value)),
                            _ => {}
                        }
                    }
                }
            }
        }

        if let Some(ts) = ts {
            stats.ts = ts;
        }

        let fss = partial_fss
            .into_iter()
            .filter_map(|(mount_point, (size, free))| {
                Some(FsStats {
                    mount_point,
                    size: size?,
                    free: free.unwrap_or(0),
                })
            })
            .collect();
        stats.fss = combine_fs_stats(fss);
        stats
    }

    /// Combined user and system CPU percentage.
    pub fn cpu_used_percent(&self) -> Option<f64> {
        match (self.cpu_user, self.cpu_sys) {
            (None, None) => None,
            (user, sys) => Some(user.unwrap_or(0.0) + sys.unwrap_or(0.0)),
        }
    }

    /// Percentage of memory in use, when both total and free are known.
    pub fn memory_used_percent(&self) -> Option<f64> {
        let total = self.memory_total?;
        let free = self.memory_free?;
        if total == 0 {
            return None;
        }
        Some(total.saturating_sub(free) as f64 * 100.0 / total as f64)
    }
}

/// Collapses duplicate reports of one mount point, keeping the larger size,
/// and orders the result by mount point.
pub fn combine_fs_stats(fss: Vec<FsStats>) -> Vec<FsStats> {
    let mut by_mount: BTreeMap<String, FsStats> = BTreeMap::new();
    for fs in fss {
        match by_mount.get(&fs.mount_point) {
            Some(existing) if existing.size >= fs.size => {}
            _ => {
                by_mount.insert(fs.mount_point.clone(), fs);
            }
        }
    }
    by_mount.into_values().collect()
}

/// Splits "/sys/fs/boot/METRICS/size" into ("/boot", "size").
///
/// The root file system reports under "/sys/fs/METRICS/...".
fn parse_fs_path(path: &str) -> Option<(String, &str)> {
    let rest = path.strip_prefix(FS_PREFIX)?;
    let idx = rest.find(FS_METRICS_DIR)?;
    let mount = &rest[..idx];
    let field = &rest[idx + FS_METRICS_DIR.len()..];
    if field.is_empty() || field.contains('/') {
        return None;
    }
    let mount = if mount.is_empty() {
        "/".to_string()
    } else {
        mount.to_string()
    };
    Some((mount, field))
}

fn to_u64(v: f64) -> u64 {
    if v.is_finite() && v > 0.0 {
        v as u64
    } else {
        0
    }
}
