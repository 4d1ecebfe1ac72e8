use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use super::rollup::Snapshot;

/// Retained cost-rollup snapshots for one endpoint.
///
/// Snapshots older than `retention` (relative to the newest one) are evicted
/// on `add`. When a state directory is configured the set is persisted as
/// JSON so a restart resumes with the same history.
#[derive(Debug)]
pub struct SnapshotStore {
    path: Option<PathBuf>,
    retention: Duration,
    snapshots: Vec<Snapshot>,
}

impl SnapshotStore {
    pub fn new(state_dir: Option<&Path>, instance_id: &str, retention: Duration) -> Self {
        Self {
            path: state_dir.map(|dir| dir.join(format!("{}.json", file_stem(instance_id)))),
            retention,
            snapshots: Vec::new(),
        }
    }

    /// Loads persisted snapshots, if any. A missing file is not an error.
    pub fn load(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let data = std::fs::read(path)
            .with_context(|| format!("reading snapshot state {}", path.display()))?;
        let mut snapshots: Vec<Snapshot> = serde_json::from_slice(&data)
            .with_context(|| format!("parsing snapshot state {}", path.display()))?;
        snapshots.sort_by_key(|s| s.window_start);
        self.snapshots = snapshots;
        self.evict();

        Ok(())
    }

    /// Adds a finalized snapshot and evicts anything past retention.
    pub fn add(&mut self, snapshot: Snapshot) {
        self.snapshots.push(snapshot);
        self.evict();
    }

    /// Persists the retained snapshots. No-op without a state directory.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let data = serde_json::to_vec(&self.snapshots).context("serializing snapshots")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;

        Ok(())
    }

    /// Returns a copy of every retained snapshot, oldest first.
    pub fn get_all(&self) -> Vec<Snapshot> {
        self.snapshots.clone()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    fn evict(&mut self) {
        let Some(newest) = self.snapshots.iter().map(|s| s.window_start).max() else {
            return;
        };
        let Some(cutoff) = newest.checked_sub(self.retention) else {
            return;
        };
        self.snapshots.retain(|s| s.window_start >= cutoff);
    }
}

fn file_stem(instance_id: &str) -> String {
    instance_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::SystemTime;

    use super::*;
    use crate::pipeline::rollup::Summary;

    fn snapshot(start_secs: u64) -> Snapshot {
        Snapshot {
            instance_id: "i-1".to_string(),
            account_id: "a".to_string(),
            region: "r".to_string(),
            host_name: "h".to_string(),
            window_start: SystemTime::UNIX_EPOCH + Duration::from_secs(start_secs),
            window: Duration::from_secs(3600),
            sample_count: 1,
            cpu_used_percent: Summary::default(),
            memory_used_percent: Summary::default(),
            memory_total: 0,
            fss: BTreeMap::new(),
        }
    }

    #[test]
    fn test_add_evicts_past_retention() {
        let mut store = SnapshotStore::new(None, "i-1", Duration::from_secs(7200));
        store.add(snapshot(0));
        store.add(snapshot(3600));
        store.add(snapshot(7200));
        assert_eq!(store.len(), 3);

        store.add(snapshot(10800));
        let all = store.get_all();
        assert_eq!(all.len(), 3);
        assert_eq!(
            all[0].window_start,
            SystemTime::UNIX_EPOCH + Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = SnapshotStore::new(Some(dir.path()), "i-1", Duration::from_secs(86400));
        store.add(snapshot(0));
        store.add(snapshot(3600));
        store.save().expect("save");

        let mut reloaded = SnapshotStore::new(Some(dir.path()), "i-1", Duration::from_secs(86400));
        reloaded.load().expect("load");
        assert_eq!(reloaded.get_all(), store.get_all());
    }

    #[test]
    fn test_load_missing_file_is_ok() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = SnapshotStore::new(Some(dir.path()), "i-none", Duration::from_secs(60));
        store.load().expect("load");
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_into_missing_dir_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("does-not-exist");
        let mut store = SnapshotStore::new(Some(&missing), "i-1", Duration::from_secs(60));
        store.add(snapshot(0));
        assert!(store.save().is_err());
    }

    #[test]
    fn test_file_stem_sanitizes() {
        assert_eq!(file_stem("i-0ab/../x"), "i-0ab____x");
    }
}
