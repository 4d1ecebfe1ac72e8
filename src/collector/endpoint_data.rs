use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::pipeline::{RollupWindow, SnapshotStore};

use super::{Endpoint, InstanceMeta};

/// Cost rollup parameters needed per endpoint.
#[derive(Debug, Clone)]
pub struct CostRollupSettings {
    pub window: Duration,
    pub retention: Duration,
    pub state_dir: Option<PathBuf>,
}

/// Which rollup sinks are configured, and their window lengths.
#[derive(Debug, Clone, Default)]
pub struct SinkSettings {
    pub cost_rollup: Option<CostRollupSettings>,
    pub billing_window: Option<Duration>,
    pub cloud_metrics_window: Option<Duration>,
}

impl SinkSettings {
    pub fn any_rollup(&self) -> bool {
        self.cost_rollup.is_some()
            || self.billing_window.is_some()
            || self.cloud_metrics_window.is_some()
    }
}

/// Per-endpoint side state owned by the sweep loop.
///
/// Windows exist only for sinks that are configured and only when the
/// endpoint carries cloud instance metadata.
#[derive(Debug, Default)]
pub struct EndpointData {
    instance: Option<InstanceMeta>,
    pub cost_rollup: Option<RollupWindow>,
    pub cost_store: Option<SnapshotStore>,
    pub billing: Option<RollupWindow>,
    pub cloud_metrics: Option<RollupWindow>,
}

impl EndpointData {
    pub fn new(endpoint: &Endpoint, settings: &SinkSettings) -> Self {
        let Some(instance) = endpoint.instance() else {
            return Self::default();
        };

        let (cost_rollup, cost_store) = match &settings.cost_rollup {
            Some(cost) => {
                let mut store = SnapshotStore::new(
                    cost.state_dir.as_deref(),
                    &instance.instance_id,
                    cost.retention,
                );
                if let Err(e) = store.load() {
                    warn!(
                        endpoint = %endpoint.key(),
                        error = %format!("{e:#}"),
                        "discarding unreadable snapshot state",
                    );
                }
                (Some(RollupWindow::new(cost.window, endpoint)), Some(store))
            }
            None => (None, None),
        };

        Self {
            instance: Some(instance.clone()),
            cost_rollup,
            cost_store,
            billing: settings
                .billing_window
                .map(|w| RollupWindow::new(w, endpoint)),
            cloud_metrics: settings
                .cloud_metrics_window
                .map(|w| RollupWindow::new(w, endpoint)),
        }
    }

    /// Rebuilds the side state if the endpoint's instance identity changed.
    /// Returns true when a rebuild happened.
    pub fn refresh(&mut self, endpoint: &Endpoint, settings: &SinkSettings) -> bool {
        if self.instance.as_ref() == endpoint.instance() {
            return false;
        }
        *self = Self::new(endpoint, settings);
        true
    }

    /// Reports whether any rollup window will consume InstanceStats.
    pub fn wants_stats(&self) -> bool {
        self.cost_rollup.is_some() || self.billing.is_some() || self.cloud_metrics.is_some()
    }
}
