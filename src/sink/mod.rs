//! Downstream sinks: writers, hot-reload handles, and their dispatch loops.

pub mod cost;
pub mod dispatch;
pub mod handle;
pub mod http;
pub mod inventory;
pub mod writer;

use anyhow::Result;

use crate::pipeline::Snapshot;

pub use dispatch::{spawn_snapshot_loop, SinkMetrics};
pub use handle::WriterHandle;
pub use writer::{SnapshotWriter, WriterConfig};

/// Sink names, also used as writer file stems and metric labels.
pub const COST_ROLLUP: &str = "cost_rollup";
pub const BILLING: &str = "billing";
pub const CLOUD_METRICS: &str = "cloud_metrics";
pub const INVENTORY: &str = "inventory";

/// Destination of single-snapshot sinks.
pub trait SnapshotWrite: Send + Sync + 'static {
    fn write(&self, snapshot: &Snapshot) -> impl std::future::Future<Output = Result<()>> + Send;
}
