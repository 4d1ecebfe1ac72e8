use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::collector::{CollectionTimings, ConnectionErrors};
use crate::sink::inventory::InventoryMetrics;
use crate::sink::SinkMetrics;

const NAMESPACE: &str = "sweepline";

/// Prometheus metrics for collector health.
///
/// All metrics use the "sweepline" namespace. Per-sink series carry a
/// `sink` label; per-protocol collection times carry `protocol`.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    started: Instant,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Sweep ===
    /// Wall time of one full sweep.
    pub sweep_duration: Histogram,
    /// Poll latency across all endpoints.
    pub collection_times: Histogram,
    /// Poll latency by connector.
    pub collection_times_by_protocol: HistogramVec,
    /// Changed metric values per endpoint poll.
    pub changed_metrics: Histogram,
    /// Values held across all endpoints.
    pub total_values: Gauge,
    /// Resident set size of this process.
    pub rss_bytes: Gauge,
    /// Seconds since startup, refreshed on scrape.
    pub elapsed_time: Gauge,

    // === Sinks ===
    pub sink_write_successes: CounterVec,
    pub sink_write_errors: CounterVec,
    pub sink_records_written: CounterVec,
    pub sink_write_duration: HistogramVec,
    pub sink_last_success: GaugeVec,
    pub sink_channel_length: GaugeVec,
    pub sink_channel_capacity: GaugeVec,

    // === Inventory ===
    pub inventory_queue_length: Gauge,
    pub inventory_time_between_writes: Histogram,
    pub inventory_write_duration: Histogram,
    pub inventory_successful_writes: Counter,
    pub inventory_total_writes: Counter,
    pub inventory_write_errors: Counter,
    pub inventory_last_success: Gauge,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

fn histogram_opts(name: &str, help: &str, buckets: Vec<f64>) -> HistogramOpts {
    HistogramOpts::new(name, help)
        .namespace(NAMESPACE)
        .buckets(buckets)
}

/// 1ms to ~65s.
fn latency_buckets() -> Result<Vec<f64>> {
    Ok(prometheus::exponential_buckets(0.001, 2.0, 17)?)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Sweep ===
        let sweep_duration = Histogram::with_opts(histogram_opts(
            "sweep_duration_seconds",
            "Wall time of one full sweep over all active endpoints.",
            prometheus::exponential_buckets(0.01, 2.0, 16)?,
        ))?;
        let collection_times = Histogram::with_opts(histogram_opts(
            "collection_time_seconds",
            "Time from connecting to an endpoint until its poll completed.",
            latency_buckets()?,
        ))?;
        let collection_times_by_protocol = HistogramVec::new(
            histogram_opts(
                "collection_time_by_protocol_seconds",
                "Poll latency by connector.",
                latency_buckets()?,
            ),
            &["protocol"],
        )?;
        let changed_metrics = Histogram::with_opts(histogram_opts(
            "changed_metrics_per_endpoint",
            "Number of metric values that changed in one endpoint poll.",
            prometheus::exponential_buckets(1.0, 4.0, 10)?,
        ))?;
        let total_values = Gauge::with_opts(opts(
            "total_metric_values",
            "Metric values held across all endpoints.",
        ))?;
        let rss_bytes = Gauge::with_opts(opts("rss_bytes", "Resident set size of the collector."))?;
        let elapsed_time = Gauge::with_opts(opts(
            "elapsed_time_seconds",
            "Seconds since the collector started.",
        ))?;

        // === Sinks ===
        let sink_write_successes = CounterVec::new(
            opts("sink_write_successes_total", "Successful writes by sink."),
            &["sink"],
        )?;
        let sink_write_errors = CounterVec::new(
            opts("sink_write_errors_total", "Failed writes by sink."),
            &["sink"],
        )?;
        let sink_records_written = CounterVec::new(
            opts("sink_records_written_total", "Records written by sink."),
            &["sink"],
        )?;
        let sink_write_duration = HistogramVec::new(
            histogram_opts(
                "sink_write_duration_seconds",
                "Write latency by sink.",
                latency_buckets()?,
            ),
            &["sink"],
        )?;
        let sink_last_success = GaugeVec::new(
            opts(
                "sink_last_success_timestamp_seconds",
                "Unix time of the last successful write by sink.",
            ),
            &["sink"],
        )?;
        let sink_channel_length = GaugeVec::new(
            opts("sink_channel_length", "Units waiting in a sink's channel."),
            &["sink"],
        )?;
        let sink_channel_capacity = GaugeVec::new(
            opts("sink_channel_capacity", "Capacity of a sink's channel."),
            &["sink"],
        )?;

        // === Inventory ===
        let inventory_queue_length = Gauge::with_opts(opts(
            "inventory_queue_length",
            "Distinct instances waiting in the inventory queue.",
        ))?;
        let inventory_time_between_writes = Histogram::with_opts(histogram_opts(
            "inventory_time_between_writes_seconds",
            "Time between consecutive inventory writes of the same instance.",
            prometheus::exponential_buckets(1.0, 2.0, 16)?,
        ))?;
        let inventory_write_duration = Histogram::with_opts(histogram_opts(
            "inventory_write_duration_seconds",
            "Inventory write latency.",
            latency_buckets()?,
        ))?;
        let inventory_successful_writes = Counter::with_opts(opts(
            "inventory_successful_writes_total",
            "Inventory records written successfully.",
        ))?;
        let inventory_total_writes = Counter::with_opts(opts(
            "inventory_writes_total",
            "Inventory records handed to the writer.",
        ))?;
        let inventory_write_errors = Counter::with_opts(opts(
            "inventory_write_errors_total",
            "Failed inventory flushes.",
        ))?;
        let inventory_last_success = Gauge::with_opts(opts(
            "inventory_last_success_timestamp_seconds",
            "Unix time of the last successful inventory write.",
        ))?;

        registry.register(Box::new(sweep_duration.clone()))?;
        registry.register(Box::new(collection_times.clone()))?;
        registry.register(Box::new(collection_times_by_protocol.clone()))?;
        registry.register(Box::new(changed_metrics.clone()))?;
        registry.register(Box::new(total_values.clone()))?;
        registry.register(Box::new(rss_bytes.clone()))?;
        registry.register(Box::new(elapsed_time.clone()))?;

        registry.register(Box::new(sink_write_successes.clone()))?;
        registry.register(Box::new(sink_write_errors.clone()))?;
        registry.register(Box::new(sink_records_written.clone()))?;
        registry.register(Box::new(sink_write_duration.clone()))?;
        registry.register(Box::new(sink_last_success.clone()))?;
        registry.register(Box::new(sink_channel_length.clone()))?;
        registry.register(Box::new(sink_channel_capacity.clone()))?;

        registry.register(Box::new(inventory_queue_length.clone()))?;
        registry.register(Box::new(inventory_time_between_writes.clone()))?;
        registry.register(Box::new(inventory_write_duration.clone()))?;
        registry.register(Box::new(inventory_successful_writes.clone()))?;
        registry.register(Box::new(inventory_total_writes.clone()))?;
        registry.register(Box::new(inventory_write_errors.clone()))?;
        registry.register(Box::new(inventory_last_success.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            started: Instant::now(),
            shutdown: parking_lot::Mutex::new(None),
            sweep_duration,
            collection_times,
            collection_times_by_protocol,
            changed_metrics,
            total_values,
            rss_bytes,
            elapsed_time,
            sink_write_successes,
            sink_write_errors,
            sink_records_written,
            sink_write_duration,
            sink_last_success,
            sink_channel_length,
            sink_channel_capacity,
            inventory_queue_length,
            inventory_time_between_writes,
            inventory_write_duration,
            inventory_successful_writes,
            inventory_total_writes,
            inventory_write_errors,
            inventory_last_success,
        })
    }

    /// Series of one sink, with its channel capacity recorded.
    pub fn sink_metrics(&self, sink: &'static str, channel_capacity: usize) -> SinkMetrics {
        self.sink_channel_capacity
            .with_label_values(&[sink])
            .set(channel_capacity as f64);
        SinkMetrics {
            name: sink,
            successes: self.sink_write_successes.with_label_values(&[sink]),
            errors: self.sink_write_errors.with_label_values(&[sink]),
            records_written: self.sink_records_written.with_label_values(&[sink]),
            write_duration: self.sink_write_duration.with_label_values(&[sink]),
            last_success: self.sink_last_success.with_label_values(&[sink]),
            channel_length: self.sink_channel_length.with_label_values(&[sink]),
        }
    }

    /// Poll latency histograms, one per listed protocol.
    pub fn collection_timings(&self, protocols: &[String]) -> CollectionTimings {
        CollectionTimings {
            collection_times: self.collection_times.clone(),
            by_protocol: protocols
                .iter()
                .map(|p| {
                    (
                        p.clone(),
                        self.collection_times_by_protocol
                            .with_label_values(&[p.as_str()]),
                    )
                })
                .collect(),
            changed_metrics: self.changed_metrics.clone(),
        }
    }

    pub fn inventory_metrics(&self) -> InventoryMetrics {
        InventoryMetrics {
            queue_length: self.inventory_queue_length.clone(),
            time_between_writes: self.inventory_time_between_writes.clone(),
            write_duration: self.inventory_write_duration.clone(),
            successful_writes: self.inventory_successful_writes.clone(),
            total_writes: self.inventory_total_writes.clone(),
            write_errors: self.inventory_write_errors.clone(),
            last_success: self.inventory_last_success.clone(),
        }
    }

    /// Starts the HTTP server serving /metrics, /healthz and /api/errors.
    /// Returns the bound address.
    pub async fn start(&self, errors: Arc<ConnectionErrors>) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
            elapsed_time: self.elapsed_time.clone(),
            started: self.started,
            errors,
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/api/errors", get(errors_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    elapsed_time: Gauge,
    started: Instant,
    errors: Arc<ConnectionErrors>,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state
        .elapsed_time
        .set(state.started.elapsed().as_secs_f64());

    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /api/errors - Latest connection error per endpoint, by host name.
async fn errors_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.errors.get_errors())
}
