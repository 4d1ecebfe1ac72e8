use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use prometheus::{Gauge, Histogram};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::clock;
use crate::pipeline::{InstanceStats, RollupWindow, Snapshot};
use crate::queue::KeyedQueue;
use crate::sink::inventory::InventoryStats;

use super::registry::apps_from_metrics;
use super::{
    ConnectionErrors, Endpoint, EndpointData, EndpointObservations, EndpointRegistry, Metric,
    MetricStore, NameAdder, PollLogger, PollState, PollStatus, StoreError, TotalCountUpdater,
};

/// Poll latency distributions.
pub struct CollectionTimings {
    pub collection_times: Histogram,
    /// Keyed by connector name.
    pub by_protocol: HashMap<String, Histogram>,
    pub changed_metrics: Histogram,
}

/// Metric paths already handed to the name index.
#[derive(Debug, Default)]
pub struct SuggestedNames {
    seen: Mutex<HashSet<String>>,
}

impl SuggestedNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `path` seen. Returns true the first time only.
    pub fn mark(&self, path: &str) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains(path) {
            return false;
        }
        seen.insert(path.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded sender into one sink loop, reporting its queue depth.
pub struct SinkSender<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    channel_length: Gauge,
}

impl<T> Clone for SinkSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            channel_length: self.channel_length.clone(),
        }
    }
}

impl<T> SinkSender<T> {
    pub fn new(name: &'static str, tx: mpsc::Sender<T>, channel_length: Gauge) -> Self {
        Self {
            name,
            tx,
            channel_length,
        }
    }

    /// Sends one unit, waiting while the channel is full.
    pub async fn send(&self, unit: T) {
        if self.tx.send(unit).await.is_err() {
            warn!(sink = self.name, "sink loop stopped, dropping unit");
        }
        self.channel_length
            .set((self.tx.max_capacity() - self.tx.capacity()) as f64);
    }
}

/// Inbound channels of the configured rollup sinks.
#[derive(Clone, Default)]
pub struct SinkChannels {
    pub cost_rollup: Option<SinkSender<Vec<Snapshot>>>,
    pub billing: Option<SinkSender<Snapshot>>,
    pub cloud_metrics: Option<SinkSender<Snapshot>>,
}

/// Units finalized during one poll, delivered once the poll returns.
#[derive(Debug, Default)]
pub struct Outbox {
    cost_rollup: Vec<Vec<Snapshot>>,
    billing: Vec<Snapshot>,
    cloud_metrics: Vec<Snapshot>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.cost_rollup.is_empty() && self.billing.is_empty() && self.cloud_metrics.is_empty()
    }

    /// Sends everything pending, in order, blocking on full channels.
    pub async fn deliver(&mut self, sinks: &SinkChannels) {
        for batch in self.cost_rollup.drain(..) {
            if let Some(tx) = &sinks.cost_rollup {
                tx.send(batch).await;
            }
        }
        for snapshot in self.billing.drain(..) {
            if let Some(tx) = &sinks.billing {
                tx.send(snapshot).await;
            }
        }
        for snapshot in self.cloud_metrics.drain(..) {
            if let Some(tx) = &sinks.cloud_metrics {
                tx.send(snapshot).await;
            }
        }
    }
}

/// State shared by every response logger.
pub struct Shared {
    pub registry: Arc<EndpointRegistry>,
    pub connection_errors: Arc<ConnectionErrors>,
    pub timings: CollectionTimings,
    pub name_adder: Arc<dyn NameAdder>,
    pub suggested: SuggestedNames,
    pub total_counts: Arc<dyn TotalCountUpdater>,
    pub inventory_queue: Option<Arc<KeyedQueue<String, InventoryStats>>>,
    pub sinks: SinkChannels,
}

/// Per-endpoint, per-sweep fan-in of poll callbacks.
pub struct ResponseLogger<'a> {
    shared: &'a Shared,
    store: &'a dyn MetricStore,
    inventory_enabled: bool,
    data: &'a mut EndpointData,
    observations: &'a EndpointObservations,
    outbox: &'a mut Outbox,
}

impl<'a> ResponseLogger<'a> {
    pub fn new(
        shared: &'a Shared,
        store: &'a dyn MetricStore,
        inventory_enabled: bool,
        data: &'a mut EndpointData,
        observations: &'a EndpointObservations,
        outbox: &'a mut Outbox,
    ) -> Self {
        Self {
            shared,
            store,
            inventory_enabled,
            data,
            observations,
            outbox,
        }
    }

    fn report_new_names(&self, metrics: &[Metric]) {
        for metric in metrics {
            if metric.value.can_to_from_float() && self.shared.suggested.mark(&metric.path) {
                self.shared.name_adder.add(&metric.path);
            }
        }
    }

    fn enqueue_inventory(&self, endpoint: &Endpoint, metrics: &[Metric], timestamp: SystemTime) {
        let Some(queue) = &self.shared.inventory_queue else {
            return;
        };
        if !self.inventory_enabled {
            return;
        }
        let Some(instance) = endpoint.instance() else {
            return;
        };
        if let Some(stats) = InventoryStats::from_metrics(metrics, &instance.instance_id, timestamp)
        {
            queue.add(stats.key().to_string(), stats);
        }
    }

    /// Feeds every configured window. Returns the cost store save error, if
    /// any, after all windows have been served.
    fn feed_rollups(&mut self, stats: &InstanceStats) -> Result<()> {
        let sinks = &self.shared.sinks;
        let mut save_result = Ok(());

        if sinks.cost_rollup.is_some() {
            if let (Some(window), Some(store)) =
                (self.data.cost_rollup.as_mut(), self.data.cost_store.as_mut())
            {
                if let Some(snapshot) = roll_over(window, stats) {
                    store.add(snapshot);
                    save_result = store.save().context("saving cost rollup snapshots");
                    self.outbox.cost_rollup.push(store.get_all());
                }
                window.add(stats);
            }
        }

        if sinks.billing.is_some() {
            if let Some(window) = self.data.billing.as_mut() {
                if let Some(snapshot) = roll_over(window, stats) {
                    self.outbox.billing.push(snapshot);
                }
                window.add(stats);
            }
        }

        if sinks.cloud_metrics.is_some() {
            if let Some(window) = self.data.cloud_metrics.as_mut() {
                if let Some(snapshot) = roll_over(window, stats) {
                    self.outbox.cloud_metrics.push(snapshot);
                }
                window.add(stats);
            }
        }

        save_result
    }
}

/// Closes the window if `stats` falls outside it, returning the finalized
/// snapshot. The window is left empty and ready for `stats`.
fn roll_over(window: &mut RollupWindow, stats: &InstanceStats) -> Option<Snapshot> {
    if window.time_ok(stats.ts) {
        return None;
    }
    let snapshot = window.take_snapshot();
    window.clear();
    snapshot
}

impl PollLogger for ResponseLogger<'_> {
    fn log_state_change(&mut self, endpoint: &Endpoint, _old: &PollState, new: &PollState) {
        if new.status == PollStatus::Synced {
            let elapsed = new.total_elapsed().as_secs_f64();
            let timings = &self.shared.timings;
            timings.collection_times.observe(elapsed);
            if let Some(hist) = timings.by_protocol.get(endpoint.connector()) {
                hist.observe(elapsed);
            }
        }
        self.shared.registry.update_state(endpoint, new);
    }

    fn log_error(&mut self, endpoint: &Endpoint, err: Option<&anyhow::Error>, state: &PollState) {
        match err {
            None => self.shared.connection_errors.clear(endpoint),
            Some(e) => self
                .shared
                .connection_errors
                .set(endpoint, e, state.timestamp),
        }
        self.shared
            .registry
            .report_error(endpoint, err, state.timestamp);
    }

    fn log_response(
        &mut self,
        endpoint: &Endpoint,
        metrics: &[Metric],
        timestamp: SystemTime,
    ) -> Result<()> {
        let ts = clock::to_epoch_secs(timestamp);
        let changed = match self.store.add_batch(endpoint.key(), ts, metrics) {
            Ok(changed) => changed,
            Err(StoreError::Inactive(key)) => {
                debug!(endpoint = %key, "endpoint went inactive during poll");
                return Ok(());
            }
            Err(StoreError::Other(e)) => return Err(e.context("appending to store")),
        };

        self.report_new_names(metrics);
        self.shared
            .registry
            .log_changed_metric_count(endpoint, changed);
        self.shared.timings.changed_metrics.observe(changed as f64);
        self.shared.total_counts.update(self.store, endpoint.key());

        if endpoint.is_health_agent() {
            self.observations
                .save(endpoint.host_name(), apps_from_metrics(metrics));
            self.enqueue_inventory(endpoint, metrics, timestamp);
        }

        if self.data.wants_stats() {
            let stats = InstanceStats::from_metrics(metrics, timestamp);
            self.feed_rollups(&stats)?;
        }

        Ok(())
    }
}
