use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::local::{MemoryStore, NameIndex, RssChecker, TotalCounts};
use crate::collector::logger::SinkSender;
use crate::collector::poller::HttpJsonPoller;
use crate::collector::{
    Collector, ConnectionErrors, CostRollupSettings, Endpoint, EndpointObservations,
    EndpointRegistry, Shared, SinkChannels, SinkSettings, SuggestedNames, SweepConfig,
};
use crate::config::Config;
use crate::export::HealthMetrics;
use crate::queue::KeyedQueue;
use crate::sink::cost::{spawn_cost_loop, CallLimits, CostWriter};
use crate::sink::handle::BuildFn;
use crate::sink::inventory::{
    spawn_inventory_loop, BufferedInventory, InventoryClient, InventoryStats,
};
use crate::sink::{
    spawn_snapshot_loop, SnapshotWriter, WriterHandle, BILLING, CLOUD_METRICS, COST_ROLLUP,
    INVENTORY,
};

/// Agent wires the collector, sinks, and health server together.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    connection_errors: Arc<ConnectionErrors>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

/// Counts writer configs found versus successfully loaded.
#[derive(Default)]
struct SinkTally {
    configured: usize,
    loaded: usize,
}

impl SinkTally {
    /// Loads a sink's writer if its config file exists. A broken config
    /// disables only that sink.
    fn load<W: Send + Sync + 'static>(
        &mut self,
        cfg: &Config,
        name: &'static str,
        build: BuildFn<W>,
    ) -> Option<Arc<WriterHandle<W>>> {
        let path = cfg.writer_config_path(name);
        if !path.exists() {
            debug!(sink = name, path = %path.display(), "no writer config, sink disabled");
            return None;
        }
        self.configured += 1;

        match WriterHandle::load(name, &path, build) {
            Ok(handle) => {
                self.loaded += 1;
                info!(sink = name, path = %path.display(), "writer loaded");
                Some(Arc::new(handle))
            }
            Err(e) => {
                error!(sink = name, error = %format!("{e:#}"), "failed to load writer, sink disabled");
                None
            }
        }
    }
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            connection_errors: Arc::new(ConnectionErrors::new()),
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin sweeping.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health server first so probes respond during startup.
        let addr = self
            .health
            .start(Arc::clone(&self.connection_errors))
            .await
            .context("starting health metrics server")?;
        info!(%addr, "health metrics server started");

        // 2. Writers and their dispatch loops.
        let (channels, settings) = self.start_sinks()?;

        // 3. Inventory queue and loop.
        let inventory_queue = self.start_inventory()?;

        // 4. Fleet state.
        let store = Arc::new(MemoryStore::new());
        let seed: Vec<Endpoint> = self
            .cfg
            .endpoints
            .iter()
            .map(|e| {
                let endpoint = Endpoint::new(&e.host, e.port, &e.app_name, &e.connector);
                match &e.instance {
                    Some(meta) => endpoint.with_instance(meta.clone()),
                    None => endpoint,
                }
            })
            .collect();
        info!(endpoints = seed.len(), "seeded endpoint registry");

        let shared = Arc::new(Shared {
            registry: Arc::new(EndpointRegistry::new(store, seed)),
            connection_errors: Arc::clone(&self.connection_errors),
            timings: self.health.collection_timings(&self.cfg.protocols),
            name_adder: Arc::new(NameIndex::new()),
            suggested: SuggestedNames::new(),
            total_counts: Arc::new(TotalCounts::new(self.health.total_values.clone())),
            inventory_queue,
            sinks: channels,
        });

        // 5. Collector.
        let sweep = SweepConfig {
            interval: self.cfg.collection_interval,
            self_host: self.cfg.host_name.clone(),
            self_name: self.cfg.name.clone(),
            self_port: self.cfg.port,
            inventory_regex: self.cfg.sinks.inventory.host_regex()?,
            sinks: settings,
        };
        let collector = Collector::new(
            HttpJsonPoller::new(self.cfg.poll_timeout).context("creating poller")?,
            shared,
            Arc::new(EndpointObservations::new()),
            Arc::new(RssChecker::new(
                self.cfg.memory.max_rss_bytes,
                self.health.rss_bytes.clone(),
            )),
            self.health.sweep_duration.clone(),
            sweep,
        );
        self.tasks.push(tokio::spawn(collector.run(self.cancel.clone())));

        info!("sweepline started");

        Ok(())
    }

    fn start_sinks(&mut self) -> Result<(SinkChannels, SinkSettings)> {
        let sinks = &self.cfg.sinks;
        let mut tally = SinkTally::default();
        let mut channels = SinkChannels::default();
        let mut settings = SinkSettings::default();

        let cost = tally.load::<CostWriter>(
            &self.cfg,
            COST_ROLLUP,
            Box::new(CostWriter::from_yaml),
        );
        let billing = tally.load::<SnapshotWriter>(
            &self.cfg,
            BILLING,
            Box::new(|contents: &str| SnapshotWriter::from_yaml(BILLING, contents)),
        );
        let cloud_metrics = tally.load::<SnapshotWriter>(
            &self.cfg,
            CLOUD_METRICS,
            Box::new(|contents: &str| SnapshotWriter::from_yaml(CLOUD_METRICS, contents)),
        );

        if tally.configured > 0 && tally.loaded == 0 {
            bail!(
                "none of the {} configured sinks could be loaded",
                tally.configured
            );
        }

        if let Some(handle) = cost {
            let capacity = sinks.cost_rollup.channel_capacity;
            let metrics = self.health.sink_metrics(COST_ROLLUP, capacity);
            let (tx, rx) = mpsc::channel(capacity);
            channels.cost_rollup = Some(SinkSender::new(
                COST_ROLLUP,
                tx,
                metrics.channel_length.clone(),
            ));
            let limits = CallLimits {
                max_instances: sinks.cost_rollup.max_instances_per_call,
                max_fs: sinks.cost_rollup.max_fs_per_call,
            };
            self.tasks
                .push(handle.spawn_watcher(sinks.reload_interval, self.cancel.clone()));
            self.tasks
                .push(spawn_cost_loop(rx, handle, limits, metrics, self.cancel.clone()));
            settings.cost_rollup = Some(CostRollupSettings {
                window: sinks.cost_rollup.window,
                retention: sinks.cost_rollup.retention,
                state_dir: sinks.cost_rollup.state_dir.clone(),
            });
        }

        for (name, handle, sink_cfg) in [
            (BILLING, billing, &sinks.billing),
            (CLOUD_METRICS, cloud_metrics, &sinks.cloud_metrics),
        ] {
            let Some(handle) = handle else { continue };
            let metrics = self.health.sink_metrics(name, sink_cfg.channel_capacity);
            let (tx, rx) = mpsc::channel(sink_cfg.channel_capacity);
            let sender = SinkSender::new(name, tx, metrics.channel_length.clone());
            if name == BILLING {
                channels.billing = Some(sender);
                settings.billing_window = Some(sink_cfg.window);
            } else {
                channels.cloud_metrics = Some(sender);
                settings.cloud_metrics_window = Some(sink_cfg.window);
            }
            self.tasks
                .push(handle.spawn_watcher(sinks.reload_interval, self.cancel.clone()));
            self.tasks
                .push(spawn_snapshot_loop(rx, handle, metrics, self.cancel.clone()));
        }

        if !settings.any_rollup() {
            warn!("no rollup sinks enabled");
        }

        Ok((channels, settings))
    }

    fn start_inventory(&mut self) -> Result<Option<Arc<KeyedQueue<String, InventoryStats>>>> {
        let inventory = &self.cfg.sinks.inventory;
        if !inventory.enabled() {
            debug!(sink = INVENTORY, "no inventory endpoint, sink disabled");
            return Ok(None);
        }

        let client = InventoryClient::new(
            &inventory.endpoint,
            &inventory.data_center,
            inventory.timeout,
        )
        .context("creating inventory client")?;
        let queue = Arc::new(KeyedQueue::new());

        self.tasks.push(spawn_inventory_loop(
            Arc::clone(&queue),
            BufferedInventory::new(client, inventory.buffer_size),
            inventory.sleep,
            self.health.inventory_metrics(),
            Instant::now(),
            self.cancel.clone(),
        ));
        info!(sink = INVENTORY, endpoint = %inventory.endpoint, "inventory sink started");

        Ok(Some(queue))
    }

    /// Stop all components gracefully.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        // Wait for loops to finish their final flushes.
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "background task failed");
            }
        }

        self.health.stop();

        Ok(())
    }
}
