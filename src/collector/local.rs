//! In-process collaborators used by the binary.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use prometheus::Gauge;
use tracing::warn;

use super::{
    EndpointKey, MemoryChecker, Metric, MetricStore, MetricValue, NameAdder, StoreError,
    TotalCountUpdater,
};

/// Assumed page size for /proc/self/statm.
const PAGE_SIZE: u64 = 4096;

/// Keeps the latest value of every series per endpoint.
#[derive(Debug, Default)]
pub struct MemoryStore {
    series: RwLock<HashMap<EndpointKey, HashMap<String, MetricValue>>>,
    inactive: Mutex<HashSet<EndpointKey>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest value stored for one path.
    pub fn latest(&self, key: &EndpointKey, path: &str) -> Option<MetricValue> {
        self.series.read().get(key)?.get(path).cloned()
    }
}

impl MetricStore for MemoryStore {
    fn add_batch(
        &self,
        key: &EndpointKey,
        _ts: f64,
        metrics: &[Metric],
    ) -> Result<usize, StoreError> {
        if self.inactive.lock().contains(key) {
            return Err(StoreError::Inactive(key.clone()));
        }

        let mut series = self.series.write();
        let values = series.entry(key.clone()).or_default();
        let mut changed = 0;
        for metric in metrics {
            match values.get(&metric.path) {
                Some(prev) if *prev == metric.value => {}
                _ => {
                    values.insert(metric.path.clone(), metric.value.clone());
                    changed += 1;
                }
            }
        }

        Ok(changed)
    }

    fn value_count(&self, key: &EndpointKey) -> usize {
        self.series.read().get(key).map_or(0, HashMap::len)
    }

    /// Retiring an endpoint drops its series.
    fn set_active(&self, key: &EndpointKey, active: bool) {
        let mut inactive = self.inactive.lock();
        if active {
            inactive.remove(key);
        } else {
            inactive.insert(key.clone());
            self.series.write().remove(key);
        }
    }
}

/// Sorted set of known metric paths.
#[derive(Debug, Default)]
pub struct NameIndex {
    names: RwLock<BTreeSet<String>>,
}

impl NameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Up to `max` known paths starting with `prefix`, in order.
    pub fn suggest(&self, prefix: &str, max: usize) -> Vec<String> {
        self.names
            .read()
            .range(prefix.to_string()..)
            .take_while(|n| n.starts_with(prefix))
            .take(max)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NameAdder for NameIndex {
    fn add(&self, path: &str) {
        self.names.write().insert(path.to_string());
    }
}

/// Series count per endpoint, exported as one fleet-wide gauge.
pub struct TotalCounts {
    per_endpoint: DashMap<EndpointKey, usize>,
    total: AtomicUsize,
    gauge: Gauge,
}

impl TotalCounts {
    pub fn new(gauge: Gauge) -> Self {
        Self {
            per_endpoint: DashMap::new(),
            total: AtomicUsize::new(0),
            gauge,
        }
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    fn adjust(&self, prev: usize, count: usize) {
        if count >= prev {
            self.total.fetch_add(count - prev, Ordering::Relaxed);
        } else {
            self.total.fetch_sub(prev - count, Ordering::Relaxed);
        }
        self.gauge.set(self.total() as f64);
    }
}

impl TotalCountUpdater for TotalCounts {
    fn update(&self, store: &dyn MetricStore, key: &EndpointKey) {
        let count = store.value_count(key);
        let prev = self.per_endpoint.insert(key.clone(), count).unwrap_or(0);
        self.adjust(prev, count);
    }

    fn forget(&self, key: &EndpointKey) {
        if let Some((_, prev)) = self.per_endpoint.remove(key) {
            self.adjust(prev, 0);
        }
    }
}

/// Warns when resident memory passes a threshold.
pub struct RssChecker {
    max_rss_bytes: u64,
    gauge: Gauge,
}

impl RssChecker {
    /// A zero threshold disables the warning but keeps the gauge updated.
    pub fn new(max_rss_bytes: u64, gauge: Gauge) -> Self {
        Self {
            max_rss_bytes,
            gauge,
        }
    }
}

impl MemoryChecker for RssChecker {
    fn check(&self) {
        let rss = match read_rss_bytes() {
            Ok(rss) => rss,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "reading resident memory");
                return;
            }
        };
        self.gauge.set(rss as f64);
        if self.max_rss_bytes > 0 && rss > self.max_rss_bytes {
            warn!(
                rss_bytes = rss,
                max_rss_bytes = self.max_rss_bytes,
                "resident memory above threshold",
            );
        }
    }
}

fn read_rss_bytes() -> Result<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").context("reading /proc/self/statm")?;
    parse_statm_rss(&statm).context("parsing /proc/self/statm")
}

fn parse_statm_rss(statm: &str) -> Option<u64> {
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * PAGE_SIZE)
}
