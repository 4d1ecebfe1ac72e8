//! Endpoint sweep, per-poll fan-in, and the collaborator seams they depend on.

pub mod endpoint_data;
pub mod errors;
pub mod local;
pub mod logger;
pub mod poller;
pub mod registry;
pub mod sweep;

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

pub use endpoint_data::{CostRollupSettings, EndpointData, SinkSettings};
pub use errors::{ConnectionError, ConnectionErrors};
pub use logger::{CollectionTimings, Outbox, ResponseLogger, Shared, SinkChannels, SuggestedNames};
pub use registry::{EndpointObservations, EndpointRegistry, EndpointStatus};
pub use sweep::{Collector, SweepConfig};

/// Application name of the per-host health agent.
pub const HEALTH_AGENT_APP: &str = "health-agent";

/// Unique identity of an endpoint within the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointKey {
    pub host_name: String,
    pub port: u16,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_name, self.port)
    }
}

/// Cloud identity of the machine an endpoint runs on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMeta {
    pub instance_id: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub region: String,
}

/// One monitored target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    key: EndpointKey,
    app_name: String,
    connector: String,
    instance: Option<InstanceMeta>,
}

impl Endpoint {
    pub fn new(host_name: &str, port: u16, app_name: &str, connector: &str) -> Self {
        Self {
            key: EndpointKey {
                host_name: host_name.to_string(),
                port,
            },
            app_name: app_name.to_string(),
            connector: connector.to_string(),
            instance: None,
        }
    }

    /// Attaches cloud instance metadata.
    pub fn with_instance(mut self, instance: InstanceMeta) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    pub fn host_name(&self) -> &str {
        &self.key.host_name
    }

    pub fn port(&self) -> u16 {
        self.key.port
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Name of the protocol used to poll this endpoint.
    pub fn connector(&self) -> &str {
        &self.connector
    }

    pub fn instance(&self) -> Option<&InstanceMeta> {
        self.instance.as_ref()
    }

    pub fn is_health_agent(&self) -> bool {
        self.app_name == HEALTH_AGENT_APP
    }
}

/// Lifecycle phase of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    WaitingToConnect,
    Connecting,
    FailedToConnect,
    WaitingToPoll,
    Polling,
    FailedToPoll,
    Synced,
}

impl PollStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WaitingToConnect => "waiting_to_connect",
            Self::Connecting => "connecting",
            Self::FailedToConnect => "failed_to_connect",
            Self::WaitingToPoll => "waiting_to_poll",
            Self::Polling => "polling",
            Self::FailedToPoll => "failed_to_poll",
            Self::Synced => "synced",
        }
    }
}

/// State of one poll, including how long each phase took.
#[derive(Debug, Clone, PartialEq)]
pub struct PollState {
    pub status: PollStatus,
    pub timestamp: SystemTime,
    pub waiting_to_connect: Duration,
    pub connecting: Duration,
    pub waiting_to_poll: Duration,
    pub polling: Duration,
}

impl PollState {
    pub fn new(status: PollStatus, timestamp: SystemTime) -> Self {
        Self {
            status,
            timestamp,
            waiting_to_connect: Duration::ZERO,
            connecting: Duration::ZERO,
            waiting_to_poll: Duration::ZERO,
            polling: Duration::ZERO,
        }
    }

    /// Returns a copy moved to a new status.
    pub fn with_status(&self, status: PollStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// Total time across the connecting, polling, and waiting phases.
    pub fn total_elapsed(&self) -> Duration {
        self.waiting_to_connect + self.connecting + self.waiting_to_poll + self.polling
    }
}

/// A single metric value as reported by an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Duration(Duration),
    Time(SystemTime),
    String(String),
}

impl MetricValue {
    /// Reports whether the value round-trips through a float, i.e. whether
    /// the time-series store can keep it as a numeric series.
    pub fn can_to_from_float(&self) -> bool {
        !matches!(self, Self::Bool(_) | Self::String(_))
    }

    /// Returns the value as a float when it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Uint(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Duration(d) => Some(d.as_secs_f64()),
            Self::Time(t) => Some(crate::clock::to_epoch_secs(*t)),
            Self::Bool(_) | Self::String(_) => None,
        }
    }
}

/// One metric from a poll response.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub path: String,
    pub value: MetricValue,
    /// Reported sample time, if the endpoint provides one.
    pub timestamp: Option<SystemTime>,
}

impl Metric {
    pub fn new(path: &str, value: MetricValue) -> Self {
        Self {
            path: path.to_string(),
            value,
            timestamp: None,
        }
    }

    pub fn at(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Callbacks a poll invokes, in poll order, as it progresses.
///
/// All work is synchronous and completes before the poll returns.
pub trait PollLogger {
    /// Called on every state transition.
    fn log_state_change(&mut self, endpoint: &Endpoint, old: &PollState, new: &PollState);

    /// Called with the poll's outcome; `None` means success.
    fn log_error(&mut self, endpoint: &Endpoint, err: Option<&anyhow::Error>, state: &PollState);

    /// Called with the metric list of a successful poll.
    fn log_response(
        &mut self,
        endpoint: &Endpoint,
        metrics: &[Metric],
        timestamp: SystemTime,
    ) -> anyhow::Result<()>;
}

/// Performs one poll of one endpoint and drives the logger callbacks.
pub trait Poller: Send + Sync {
    fn poll<L: PollLogger + Send>(
        &self,
        endpoint: &Endpoint,
        sweep_start: SystemTime,
        port: u16,
        logger: &mut L,
    ) -> impl std::future::Future<Output = ()> + Send;
}

/// Failure appending to the time-series store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The endpoint was retired while its poll was in flight.
    #[error("endpoint {0} is inactive")]
    Inactive(EndpointKey),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Time-series store the collector appends to.
pub trait MetricStore: Send + Sync {
    /// Appends one poll's metrics at `ts` (seconds since epoch). Returns the
    /// number of values that changed.
    fn add_batch(&self, key: &EndpointKey, ts: f64, metrics: &[Metric])
        -> Result<usize, StoreError>;

    /// Number of distinct series held for an endpoint.
    fn value_count(&self, key: &EndpointKey) -> usize;

    /// Marks an endpoint active or retired.
    fn set_active(&self, key: &EndpointKey, active: bool);
}

/// Index of metric paths used for name suggestions.
pub trait NameAdder: Send + Sync {
    fn add(&self, path: &str);
}

/// Aggregate of value counts across the fleet.
pub trait TotalCountUpdater: Send + Sync {
    fn update(&self, store: &dyn MetricStore, key: &EndpointKey);

    /// Drops an endpoint that left the active set.
    fn forget(&self, key: &EndpointKey);
}

/// Liveness hook run after every sweep.
pub trait MemoryChecker: Send + Sync {
    fn check(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_elapsed_sums_phases() {
        let mut state = PollState::new(PollStatus::Synced, SystemTime::UNIX_EPOCH);
        state.waiting_to_connect = Duration::from_millis(1);
        state.connecting = Duration::from_millis(2);
        state.waiting_to_poll = Duration::from_millis(3);
        state.polling = Duration::from_millis(4);
        assert_eq!(state.total_elapsed(), Duration::from_millis(10));
    }

    #[test]
    fn test_metric_value_numeric() {
        assert!(MetricValue::Float(1.5).can_to_from_float());
        assert!(MetricValue::Duration(Duration::from_secs(2)).can_to_from_float());
        assert!(!MetricValue::String("x".to_string()).can_to_from_float());
        assert!(!MetricValue::Bool(true).can_to_from_float());

        assert_eq!(MetricValue::Int(-3).as_f64(), Some(-3.0));
        assert_eq!(
            MetricValue::Duration(Duration::from_millis(1500)).as_f64(),
            Some(1.5)
        );
        assert_eq!(MetricValue::Bool(true).as_f64(), None);
    }

    #[test]
    fn test_endpoint_accessors() {
        let endpoint = Endpoint::new("host-a", 6910, HEALTH_AGENT_APP, "json");
        assert!(endpoint.is_health_agent());
        assert_eq!(endpoint.key().to_string(), "host-a:6910");
        assert!(endpoint.instance().is_none());
    }
}
