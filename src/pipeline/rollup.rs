use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::clock;
use crate::collector::Endpoint;

use super::stats::InstanceStats;

/// Running count/sum/min/max of one measured quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Summary {
    /// Folds one sample in.
    pub fn add(&mut self, v: f64) {
        if self.count == 0 {
            self.min = v;
            self.max = v;
        } else {
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
        self.count += 1;
        self.sum += v;
    }

    /// Mean of all samples, or None if nothing was added.
    pub fn avg(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

/// Window rollup of one file system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FsSummary {
    /// Largest reported size in the window.
    pub size: u64,
    pub used_percent: Summary,
}

/// Finalized rollup of one endpoint's measurements over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub instance_id: String,
    pub account_id: String,
    pub region: String,
    pub host_name: String,
    pub window_start: SystemTime,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub sample_count: u64,
    pub cpu_used_percent: Summary,
    pub memory_used_percent: Summary,
    pub memory_total: u64,
    /// Keyed by mount point.
    pub fss: BTreeMap<String, FsSummary>,
}

#[derive(Debug, Default)]
struct Accumulator {
    sample_count: u64,
    cpu_used_percent: Summary,
    memory_used_percent: Summary,
    memory_total: u64,
    fss: BTreeMap<String, FsSummary>,
}

impl Accumulator {
    fn add(&mut self, stats: &InstanceStats) {
        self.sample_count += 1;
        if let Some(cpu) = stats.cpu_used_percent() {
            self.cpu_used_percent.add(cpu);
        }
        if let Some(mem) = stats.memory_used_percent() {
            self.memory_used_percent.add(mem);
        }
        if let Some(total) = stats.memory_total {
            self.memory_total = self.memory_total.max(total);
        }
        for fs in &stats.fss {
            let entry = self.fss.entry(fs.mount_point.clone()).or_default();
            entry.size = entry.size.max(fs.size);
            if let Some(used) = fs.used_percent() {
                entry.used_percent.add(used);
            }
        }
    }
}

/// Accumulates one endpoint's InstanceStats for one sink over fixed-length,
/// epoch-aligned windows.
///
/// Callers check `time_ok` before each `add`; when it fails they take the
/// snapshot, hand it downstream, `clear`, and only then add the new sample.
#[derive(Debug)]
pub struct RollupWindow {
    length: Duration,
    instance_id: String,
    account_id: String,
    region: String,
    host_name: String,
    bucket: Option<u64>,
    acc: Accumulator,
}

impl RollupWindow {
    /// Creates an empty window of the given length for an endpoint.
    pub fn new(length: Duration, endpoint: &Endpoint) -> Self {
        let instance = endpoint.instance().cloned().unwrap_or_default();
        Self {
            length,
            instance_id: instance.instance_id,
            account_id: instance.account_id,
            region: instance.region,
            host_name: endpoint.host_name().to_string(),
            bucket: None,
            acc: Accumulator::default(),
        }
    }

    /// Returns the window length.
    pub fn length(&self) -> Duration {
        self.length
    }

    /// Reports whether `ts` belongs to the open window. An empty window
    /// accepts any timestamp.
    pub fn time_ok(&self, ts: SystemTime) -> bool {
        match self.bucket {
            None => true,
            Some(bucket) => bucket == clock::bucket_index(ts, self.length),
        }
    }

    /// Folds one measurement into the open window.
    pub fn add(&mut self, stats: &InstanceStats) {
        if self.bucket.is_none() {
            self.bucket = Some(clock::bucket_index(stats.ts, self.length));
        }
        self.acc.add(stats);
    }

    /// Materializes the open window without clearing it. Returns None if
    /// nothing has been added.
    pub fn take_snapshot(&self) -> Option<Snapshot> {
        let bucket = self.bucket?;
        Some(Snapshot {
            instance_id: self.instance_id.clone(),
            account_id: self.account_id.clone(),
            region: self.region.clone(),
            host_name: self.host_name.clone(),
            window_start: clock::bucket_start(bucket, self.length),
            window: self.length,
            sample_count: self.acc.sample_count,
            cpu_used_percent: self.acc.cpu_used_percent,
            memory_used_percent: self.acc.memory_used_percent,
            memory_total: self.acc.memory_total,
            fss: self.acc.fss.clone(),
        })
    }

    /// Resets the window for the next interval.
    pub fn clear(&mut self) {
        self.bucket = None;
        self.acc = Accumulator::default();
    }

    pub fn is_empty(&self) -> bool {
        self.bucket.is_none()
    }
}
