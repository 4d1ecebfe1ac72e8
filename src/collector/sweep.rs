use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use prometheus::Histogram;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    EndpointData, EndpointKey, EndpointObservations, MemoryChecker, Outbox, Poller,
    ResponseLogger, Shared, SinkSettings,
};

/// Sweep pacing and per-endpoint sink applicability.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Target time between sweep starts.
    pub interval: Duration,
    /// Self-registration identity. An empty host skips registration.
    pub self_host: String,
    pub self_name: String,
    pub self_port: u16,
    /// Hosts whose inventory is exported; None exports every host.
    pub inventory_regex: Option<Regex>,
    pub sinks: SinkSettings,
}

/// The top-level collection loop.
pub struct Collector<P> {
    poller: P,
    shared: Arc<Shared>,
    observations: Arc<EndpointObservations>,
    memory_checker: Arc<dyn MemoryChecker>,
    sweep_duration: Histogram,
    config: SweepConfig,
    endpoint_data: HashMap<EndpointKey, EndpointData>,
}

impl<P: Poller> Collector<P> {
    pub fn new(
        poller: P,
        shared: Arc<Shared>,
        observations: Arc<EndpointObservations>,
        memory_checker: Arc<dyn MemoryChecker>,
        sweep_duration: Histogram,
        config: SweepConfig,
    ) -> Self {
        Self {
            poller,
            shared,
            observations,
            memory_checker,
            sweep_duration,
            config,
            endpoint_data: HashMap::new(),
        }
    }

    fn inventory_enabled(&self, host_name: &str) -> bool {
        if self.shared.inventory_queue.is_none() {
            return false;
        }
        self.config
            .inventory_regex
            .as_ref()
            .map_or(true, |re| re.is_match(host_name))
    }

    /// Polls every active endpoint once, sequentially. Returns how long the
    /// sweep took.
    pub async fn sweep(&mut self) -> Duration {
        let started = Instant::now();
        let sweep_start = SystemTime::now();
        let (endpoints, store) = self.shared.registry.all_active_with_store();

        for endpoint in &endpoints {
            let inventory_enabled = self.inventory_enabled(endpoint.host_name());
            let settings = &self.config.sinks;
            let data = self
                .endpoint_data
                .entry(endpoint.key().clone())
                .or_insert_with(|| EndpointData::new(endpoint, settings));
            data.refresh(endpoint, settings);

            let mut outbox = Outbox::new();
            {
                let mut logger = ResponseLogger::new(
                    &self.shared,
                    store.as_ref(),
                    inventory_enabled,
                    data,
                    &self.observations,
                    &mut outbox,
                );
                self.poller
                    .poll(endpoint, sweep_start, endpoint.port(), &mut logger)
                    .await;
            }
            // Blocks while a sink's channel is full.
            outbox.deliver(&self.shared.sinks).await;
        }

        let active: HashSet<&EndpointKey> = endpoints.iter().map(|e| e.key()).collect();
        let total_counts = &self.shared.total_counts;
        self.endpoint_data.retain(|key, _| {
            let keep = active.contains(key);
            if !keep {
                total_counts.forget(key);
            }
            keep
        });

        let elapsed = started.elapsed();
        self.sweep_duration.observe(elapsed.as_secs_f64());
        debug!(
            endpoints = endpoints.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "sweep complete",
        );
        elapsed
    }

    /// Sweeps until cancelled, pacing to the configured interval. An overrun
    /// sweep is followed immediately by the next one.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(interval = ?self.config.interval, "collector started");

        loop {
            let elapsed = self.sweep().await;
            self.memory_checker.check();

            if let Some(remaining) = self.config.interval.checked_sub(elapsed) {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(remaining) => {}
                }
            } else if cancel.is_cancelled() {
                break;
            }

            if !self.config.self_host.is_empty() {
                self.observations.maybe_add_app(
                    &self.config.self_host,
                    &self.config.self_name,
                    self.config.self_port,
                );
            }
            self.shared.registry.update_endpoints(&self.observations);
        }

        info!("collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use prometheus::{Gauge, HistogramOpts};

    use super::*;
    use crate::collector::local::{MemoryStore, NameIndex, TotalCounts};
    use tokio::sync::mpsc;

    use crate::collector::logger::SinkSender;
    use crate::collector::{
        CollectionTimings, ConnectionErrors, CostRollupSettings, Endpoint, EndpointRegistry,
        InstanceMeta, Metric, MetricValue, PollLogger, PollState, PollStatus, SinkChannels,
        SuggestedNames,
    };
    use crate::pipeline::Snapshot;

    fn hist(name: &str) -> Histogram {
        Histogram::with_opts(HistogramOpts::new(name, "test")).expect("histogram")
    }

    /// Answers every poll with a fixed metric list and records who was polled.
    struct FakePoller {
        polled: Mutex<Vec<String>>,
    }

    impl Poller for FakePoller {
        async fn poll<L: PollLogger + Send>(
            &self,
            endpoint: &Endpoint,
            sweep_start: SystemTime,
            _port: u16,
            logger: &mut L,
        ) {
            self.polled.lock().push(endpoint.host_name().to_string());
            let old = PollState::new(PollStatus::Polling, sweep_start);
            let new = old.with_status(PollStatus::Synced);
            let metrics = vec![Metric::new("/x", MetricValue::Int(1))];
            let result = logger.log_response(endpoint, &metrics, sweep_start);
            logger.log_state_change(endpoint, &old, &new);
            logger.log_error(endpoint, result.as_ref().err(), &new);
        }
    }

    struct CountingChecker(AtomicUsize);

    impl MemoryChecker for CountingChecker {
        fn check(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn collector(
        interval: Duration,
        regex: Option<Regex>,
    ) -> (Collector<FakePoller>, Arc<MemoryStore>) {
        collector_with(
            FakePoller {
                polled: Mutex::new(Vec::new()),
            },
            interval,
            regex,
            "collector-host",
            vec![
                Endpoint::new("host-b", 1, "app", "json"),
                Endpoint::new("host-a", 1, "app", "json"),
            ],
            SinkChannels::default(),
            SinkSettings::default(),
        )
    }

    fn collector_with<P: Poller>(
        poller: P,
        interval: Duration,
        regex: Option<Regex>,
        self_host: &str,
        seed: Vec<Endpoint>,
        sinks: SinkChannels,
        settings: SinkSettings,
    ) -> (Collector<P>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let shared = Arc::new(Shared {
            registry: Arc::new(EndpointRegistry::new(store.clone(), seed)),
            connection_errors: Arc::new(ConnectionErrors::new()),
            timings: CollectionTimings {
                collection_times: hist("collection_times"),
                by_protocol: HashMap::new(),
                changed_metrics: hist("changed_metrics"),
            },
            name_adder: Arc::new(NameIndex::new()),
            suggested: SuggestedNames::new(),
            total_counts: Arc::new(TotalCounts::new(
                Gauge::new("total", "test").expect("gauge"),
            )),
            inventory_queue: Some(Arc::new(crate::queue::KeyedQueue::new())),
            sinks,
        });
        let config = SweepConfig {
            interval,
            self_host: self_host.to_string(),
            self_name: "sweepline".to_string(),
            self_port: 6980,
            inventory_regex: regex,
            sinks: settings,
        };
        let collector = Collector::new(
            poller,
            shared,
            Arc::new(EndpointObservations::new()),
            Arc::new(CountingChecker(AtomicUsize::new(0))),
            hist("sweep_duration"),
            config,
        );
        (collector, store)
    }

    /// Aligned to a 60s bucket boundary.
    const T0: u64 = 1_700_000_040;

    /// Logs one sample at T0 and one at T0+60, closing every 60s window.
    struct RolloverPoller;

    impl Poller for RolloverPoller {
        async fn poll<L: PollLogger + Send>(
            &self,
            endpoint: &Endpoint,
            _sweep_start: SystemTime,
            _port: u16,
            logger: &mut L,
        ) {
            for offset in [0, 60] {
                let ts = SystemTime::UNIX_EPOCH + Duration::from_secs(T0 + offset);
                let metrics = vec![Metric::new("/sys/cpu/user", MetricValue::Float(10.0))];
                if let Err(e) = logger.log_response(endpoint, &metrics, ts) {
                    panic!("response rejected: {e:#}");
                }
            }
        }
    }

    fn instance_endpoint(host: &str, instance_id: &str) -> Endpoint {
        Endpoint::new(host, 1, "app", "json").with_instance(InstanceMeta {
            instance_id: instance_id.to_string(),
            ..InstanceMeta::default()
        })
    }

    fn filler() -> Snapshot {
        Snapshot {
            instance_id: "filler".to_string(),
            account_id: String::new(),
            region: String::new(),
            host_name: String::new(),
            window_start: SystemTime::UNIX_EPOCH,
            window: Duration::from_secs(60),
            sample_count: 1,
            cpu_used_percent: Default::default(),
            memory_used_percent: Default::default(),
            memory_total: 0,
            fss: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_sweep_polls_every_active_endpoint() {
        let (mut collector, store) = collector(Duration::from_secs(60), None);

        collector.sweep().await;

        let mut polled = collector.poller.polled.lock().clone();
        polled.sort();
        assert_eq!(polled, vec!["host-a", "host-b"]);
        assert_eq!(collector.sweep_duration.get_sample_count(), 1);
        let key = EndpointKey {
            host_name: "host-a".to_string(),
            port: 1,
        };
        assert_eq!(store.latest(&key, "/x"), Some(MetricValue::Int(1)));
        assert_eq!(collector.endpoint_data.len(), 2);
    }

    #[test]
    fn test_inventory_regex_filter() {
        let regex = Regex::new("^prod-").expect("regex");
        let (collector, _) = collector(Duration::from_secs(60), Some(regex));
        assert!(collector.inventory_enabled("prod-1"));
        assert!(!collector.inventory_enabled("dev-1"));

        let (unfiltered, _) = self::collector(Duration::from_secs(60), None);
        assert!(unfiltered.inventory_enabled("dev-1"));
    }

    #[tokio::test]
    async fn test_run_self_registers_and_stops() {
        let (collector, _) = collector(Duration::from_millis(10), None);
        let registry = Arc::clone(&collector.shared.registry);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(collector.run(cancel.clone()));

        let mut registered = false;
        for _ in 0..200 {
            let (active, _) = registry.all_active_with_store();
            if active.iter().any(|e| e.host_name() == "collector-host") {
                registered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        task.await.expect("collector should stop cleanly");
        assert!(registered, "collector should register itself");
    }

    #[tokio::test]
    async fn test_run_without_host_name_skips_self_registration() {
        let (collector, _) = collector_with(
            FakePoller {
                polled: Mutex::new(Vec::new()),
            },
            Duration::from_millis(10),
            None,
            "",
            vec![
                Endpoint::new("host-b", 1, "app", "json"),
                Endpoint::new("host-a", 1, "app", "json"),
            ],
            SinkChannels::default(),
            SinkSettings::default(),
        );
        let registry = Arc::clone(&collector.shared.registry);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(collector.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.expect("collector should stop cleanly");

        let (active, _) = registry.all_active_with_store();
        let mut hosts: Vec<_> = active.iter().map(|e| e.host_name().to_string()).collect();
        hosts.sort();
        assert_eq!(hosts, vec!["host-a", "host-b"]);
    }

    #[tokio::test]
    async fn test_full_sink_channel_stalls_sweep_without_loss() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(filler()).expect("channel starts with room");
        let sinks = SinkChannels {
            billing: Some(SinkSender::new(
                "billing",
                tx,
                Gauge::new("len", "test").expect("gauge"),
            )),
            ..SinkChannels::default()
        };
        let settings = SinkSettings {
            billing_window: Some(Duration::from_secs(60)),
            ..SinkSettings::default()
        };
        let (mut collector, _) = collector_with(
            RolloverPoller,
            Duration::from_secs(60),
            None,
            "",
            vec![instance_endpoint("host-a", "i-a"), instance_endpoint("host-b", "i-b")],
            sinks,
            settings,
        );

        let task = tokio::spawn(async move {
            collector.sweep().await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished(), "sweep should wait on the full channel");

        assert_eq!(rx.recv().await.expect("filler").instance_id, "filler");
        let mut ids = vec![
            rx.recv().await.expect("first snapshot").instance_id,
            rx.recv().await.expect("second snapshot").instance_id,
        ];
        task.await.expect("sweep finishes once drained");
        ids.sort();
        assert_eq!(ids, vec!["i-a", "i-b"]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_one_sample_closes_all_three_windows() {
        let (cost_tx, mut cost_rx) = mpsc::channel(4);
        let (billing_tx, mut billing_rx) = mpsc::channel(4);
        let (cloud_tx, mut cloud_rx) = mpsc::channel(4);
        let len = || Gauge::new("len", "test").expect("gauge");
        let sinks = SinkChannels {
            cost_rollup: Some(SinkSender::new("cost_rollup", cost_tx, len())),
            billing: Some(SinkSender::new("billing", billing_tx, len())),
            cloud_metrics: Some(SinkSender::new("cloud_metrics", cloud_tx, len())),
        };
        let settings = SinkSettings {
            cost_rollup: Some(CostRollupSettings {
                window: Duration::from_secs(60),
                retention: Duration::from_secs(3600),
                state_dir: None,
            }),
            billing_window: Some(Duration::from_secs(60)),
            cloud_metrics_window: Some(Duration::from_secs(60)),
        };
        let (mut collector, _) = collector_with(
            RolloverPoller,
            Duration::from_secs(60),
            None,
            "",
            vec![instance_endpoint("host-a", "i-a")],
            sinks,
            settings,
        );

        collector.sweep().await;

        let batch = cost_rx.try_recv().expect("cost rollup batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].instance_id, "i-a");
        assert_eq!(billing_rx.try_recv().expect("billing").instance_id, "i-a");
        assert_eq!(cloud_rx.try_recv().expect("cloud metrics").instance_id, "i-a");
        assert!(cost_rx.try_recv().is_err());
        assert!(billing_rx.try_recv().is_err());
        assert!(cloud_rx.try_recv().is_err());
    }
}
