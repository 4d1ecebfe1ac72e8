use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::clock;

use super::{Endpoint, Metric, MetricValue, PollLogger, PollState, PollStatus, Poller};

/// Path served by endpoints speaking the JSON protocol.
pub const METRICS_PATH: &str = "/metrics.json";

/// Metric as encoded on the wire.
#[derive(Debug, Deserialize)]
struct WireMetric {
    path: String,
    value: serde_json::Value,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    timestamp: Option<f64>,
}

impl WireMetric {
    fn into_metric(self) -> Option<Metric> {
        let value = match self.value {
            serde_json::Value::Bool(b) => MetricValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    MetricValue::Uint(u)
                } else if let Some(i) = n.as_i64() {
                    MetricValue::Int(i)
                } else {
                    MetricValue::Float(n.as_f64()?)
                }
            }
            serde_json::Value::String(s) => MetricValue::String(s),
            _ => return None,
        };
        Some(Metric {
            path: self.path,
            value,
            timestamp: self.timestamp.map(clock::from_epoch_secs),
        })
    }
}

/// Polls endpoints by fetching their metric list as JSON over HTTP.
pub struct HttpJsonPoller {
    client: reqwest::Client,
}

impl HttpJsonPoller {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &str) -> Result<reqwest::Response> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("connecting to {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("{url} returned unexpected status: {status}"));
        }
        Ok(resp)
    }
}

fn transition<L: PollLogger>(
    logger: &mut L,
    endpoint: &Endpoint,
    state: &mut PollState,
    status: PollStatus,
) {
    let mut next = state.with_status(status);
    next.timestamp = SystemTime::now();
    logger.log_state_change(endpoint, state, &next);
    *state = next;
}

impl Poller for HttpJsonPoller {
    async fn poll<L: PollLogger + Send>(
        &self,
        endpoint: &Endpoint,
        sweep_start: SystemTime,
        port: u16,
        logger: &mut L,
    ) {
        let mut state = PollState::new(PollStatus::WaitingToConnect, sweep_start);
        let url = format!("http://{}:{}{}", endpoint.host_name(), port, METRICS_PATH);

        transition(logger, endpoint, &mut state, PollStatus::Connecting);
        let started = Instant::now();
        let fetched = self.fetch(&url).await;
        state.connecting = started.elapsed();

        let resp = match fetched {
            Ok(resp) => resp,
            Err(e) => {
                transition(logger, endpoint, &mut state, PollStatus::FailedToConnect);
                logger.log_error(endpoint, Some(&e), &state);
                return;
            }
        };

        transition(logger, endpoint, &mut state, PollStatus::Polling);
        let started = Instant::now();
        let body = resp
            .json::<Vec<WireMetric>>()
            .await
            .with_context(|| format!("decoding metrics from {url}"));
        state.polling = started.elapsed();

        let wire = match body {
            Ok(wire) => wire,
            Err(e) => {
                transition(logger, endpoint, &mut state, PollStatus::FailedToPoll);
                logger.log_error(endpoint, Some(&e), &state);
                return;
            }
        };

        let metrics: Vec<Metric> = wire.into_iter().filter_map(WireMetric::into_metric).collect();
        let result = logger.log_response(endpoint, &metrics, sweep_start);
        transition(logger, endpoint, &mut state, PollStatus::Synced);
        logger.log_error(endpoint, result.as_ref().err(), &state);
    }
}
