//! Per-instance inventory export, fed through the coalescing queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use prometheus::{Counter, Gauge, Histogram};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::clock;
use crate::collector::Metric;
use crate::queue::KeyedQueue;

use super::http::HttpTarget;

const PACKAGES_PREFIX: &str = "/sys/packages/";

/// Retained records after failed flushes are capped at this multiple of the
/// buffer capacity.
const RETAIN_FACTOR: usize = 4;

/// One installed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Package {
    pub manager: String,
    pub name: String,
    pub version: String,
    pub size: u64,
}

/// Inventory of one instance as of one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryStats {
    pub instance_id: String,
    pub ts: SystemTime,
    /// Ordered by manager, then name.
    pub packages: Vec<Package>,
}

impl InventoryStats {
    /// Collects packages reported under "/sys/packages/<manager>/<name>/".
    /// Returns None when the response carries no package metrics.
    pub fn from_metrics(metrics: &[Metric], instance_id: &str, ts: SystemTime) -> Option<Self> {
        let mut packages: BTreeMap<(String, String), Package> = BTreeMap::new();

        for metric in metrics {
            let Some(rest) = metric.path.strip_prefix(PACKAGES_PREFIX) else {
                continue;
            };
            let mut parts = rest.splitn(3, '/');
            let (Some(manager), Some(name), Some(field)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if manager.is_empty() || name.is_empty() {
                continue;
            }

            let package = packages
                .entry((manager.to_string(), name.to_string()))
                .or_insert_with(|| Package {
                    manager: manager.to_string(),
                    name: name.to_string(),
                    version: String::new(),
                    size: 0,
                });
            match field {
                "version" => {
                    if let crate::collector::MetricValue::String(v) = &metric.value {
                        package.version = v.clone();
                    }
                }
                "size" => {
                    if let Some(v) = metric.value.as_f64() {
                        package.size = if v > 0.0 { v as u64 } else { 0 };
                    }
                }
                _ => {}
            }
        }

        if packages.is_empty() {
            return None;
        }

        Some(Self {
            instance_id: instance_id.to_string(),
            ts,
            packages: packages.into_values().collect(),
        })
    }

    /// Coalescing key.
    pub fn key(&self) -> &str {
        &self.instance_id
    }
}

/// Destination of inventory records.
pub trait InventoryWrite: Send + Sync + 'static {
    fn write(&self, records: &[InventoryStats])
        -> impl std::future::Future<Output = Result<()>> + Send;
}

#[derive(Serialize)]
struct InventoryRecord<'a> {
    instance_id: &'a str,
    timestamp: String,
    packages: &'a [Package],
}

#[derive(Serialize)]
struct InventoryRequest<'a> {
    data_center: &'a str,
    records: Vec<InventoryRecord<'a>>,
}

/// HTTP client of the inventory service.
pub struct InventoryClient {
    target: HttpTarget,
    data_center: String,
}

impl InventoryClient {
    pub fn new(endpoint: &str, data_center: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            target: HttpTarget::new(endpoint, &HashMap::new(), "none", timeout)?,
            data_center: data_center.to_string(),
        })
    }
}

impl InventoryWrite for InventoryClient {
    async fn write(&self, records: &[InventoryStats]) -> Result<()> {
        let request = InventoryRequest {
            data_center: &self.data_center,
            records: records
                .iter()
                .map(|r| InventoryRecord {
                    instance_id: &r.instance_id,
                    timestamp: clock::format_datetime(r.ts),
                    packages: &r.packages,
                })
                .collect(),
        };
        self.target.post_json(&request).await
    }
}

/// Buffers inventory records and sends them in bulk.
///
/// Records from a failed flush stay buffered for the next one.
pub struct BufferedInventory<W> {
    client: W,
    capacity: usize,
    pending: Vec<InventoryStats>,
}

impl<W: InventoryWrite> BufferedInventory<W> {
    pub fn new(client: W, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            client,
            capacity,
            pending: Vec::with_capacity(capacity),
        }
    }

    /// Buffers one record, flushing once the buffer is full. Returns the
    /// number of records written.
    pub async fn write(&mut self, stats: InventoryStats) -> Result<usize> {
        self.pending.push(stats);
        if self.pending.len() >= self.capacity {
            return self.flush().await;
        }
        Ok(0)
    }

    /// Sends everything buffered. Returns the number of records written.
    pub async fn flush(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        match self.client.write(&self.pending).await {
            Ok(()) => {
                let written = self.pending.len();
                self.pending.clear();
                Ok(written)
            }
            Err(e) => {
                let limit = self.capacity * RETAIN_FACTOR;
                if self.pending.len() > limit {
                    let dropped = self.pending.len() - limit;
                    self.pending.drain(..dropped);
                    warn!(dropped, retained = limit, "dropping oldest inventory records");
                }
                Err(e)
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Inventory loop instrumentation.
#[derive(Clone)]
pub struct InventoryMetrics {
    pub queue_length: Gauge,
    pub time_between_writes: Histogram,
    pub write_duration: Histogram,
    pub successful_writes: Counter,
    pub total_writes: Counter,
    pub write_errors: Counter,
    pub last_success: Gauge,
}

impl InventoryMetrics {
    fn record(&self, result: &Result<usize>) {
        match result {
            Ok(written) => {
                self.successful_writes.inc_by(*written as f64);
                if *written > 0 {
                    self.last_success
                        .set(clock::to_epoch_secs(SystemTime::now()));
                }
            }
            Err(e) => {
                self.write_errors.inc();
                warn!(error = %format!("{e:#}"), "inventory write failed");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn unregistered() -> Self {
        use prometheus::HistogramOpts;

        let hist = |name: &str| {
            Histogram::with_opts(HistogramOpts::new(name, "test")).expect("histogram")
        };
        Self {
            queue_length: Gauge::new("queue_length", "test").expect("gauge"),
            time_between_writes: hist("time_between_writes"),
            write_duration: hist("write_duration"),
            successful_writes: Counter::new("successful_writes", "test").expect("counter"),
            total_writes: Counter::new("total_writes", "test").expect("counter"),
            write_errors: Counter::new("write_errors", "test").expect("counter"),
            last_success: Gauge::new("last_success", "test").expect("gauge"),
        }
    }
}

/// Runs the inventory loop.
///
/// When the queue is empty, buffered records are flushed before blocking so
/// quiet periods do not hold records back. `sleep` throttles the loop after
/// such a flush.
pub fn spawn_inventory_loop<W: InventoryWrite>(
    queue: Arc<KeyedQueue<String, InventoryStats>>,
    mut client: BufferedInventory<W>,
    sleep: Duration,
    metrics: InventoryMetrics,
    started: Instant,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_by_key: HashMap<String, SystemTime> = HashMap::new();

        loop {
            if queue.is_empty() {
                let result = client.flush().await;
                metrics.record(&result);
                if !sleep.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(sleep) => {}
                    }
                }
            }
            metrics.queue_length.set(queue.len() as f64);

            let stats = tokio::select! {
                _ = cancel.cancelled() => break,
                stats = queue.remove() => stats,
            };

            let since_last = match last_by_key.get(stats.key()) {
                Some(last) => stats.ts.duration_since(*last).unwrap_or_default(),
                // First write of a key counts from process start.
                None => started.elapsed(),
            };
            metrics
                .time_between_writes
                .observe(since_last.as_secs_f64());
            last_by_key.insert(stats.key().to_string(), stats.ts);

            let start = Instant::now();
            let result = client.write(stats).await;
            metrics.record(&result);
            metrics.total_writes.inc();
            metrics.write_duration.observe(start.elapsed().as_secs_f64());
        }

        let result = client.flush().await;
        metrics.record(&result);
        tracing::debug!("inventory loop stopped");
    })
}
