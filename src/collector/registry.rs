use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::info;

use crate::clock::format_datetime;

use super::{Endpoint, EndpointKey, InstanceMeta, Metric, MetricStore, PollState, PollStatus};

/// Connector used for endpoints discovered through a health agent.
const OBSERVED_CONNECTOR: &str = "json";

/// Externally visible status of one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub host_name: String,
    pub port: u16,
    pub app_name: String,
    pub active: bool,
    pub status: Option<PollStatus>,
    pub last_update: Option<String>,
    pub last_error: Option<String>,
    pub last_error_at: Option<String>,
    pub changed_metrics: usize,
}

impl EndpointStatus {
    fn new(endpoint: &Endpoint) -> Self {
        Self {
            host_name: endpoint.host_name().to_string(),
            port: endpoint.port(),
            app_name: endpoint.app_name().to_string(),
            active: true,
            status: None,
            last_update: None,
            last_error: None,
            last_error_at: None,
            changed_metrics: 0,
        }
    }
}

struct Entry {
    endpoint: Endpoint,
    active: bool,
    /// Added from health agent observations rather than configuration.
    observed: bool,
}

/// The monitored fleet and its per-endpoint status.
pub struct EndpointRegistry {
    store: Arc<dyn MetricStore>,
    endpoints: RwLock<BTreeMap<EndpointKey, Entry>>,
    statuses: DashMap<EndpointKey, EndpointStatus>,
}

impl EndpointRegistry {
    /// Creates a registry seeded with a static endpoint list.
    pub fn new(store: Arc<dyn MetricStore>, seed: Vec<Endpoint>) -> Self {
        let statuses = DashMap::new();
        let mut endpoints = BTreeMap::new();
        for endpoint in seed {
            statuses.insert(endpoint.key().clone(), EndpointStatus::new(&endpoint));
            endpoints.insert(
                endpoint.key().clone(),
                Entry {
                    endpoint,
                    active: true,
                    observed: false,
                },
            );
        }

        Self {
            store,
            endpoints: RwLock::new(endpoints),
            statuses,
        }
    }

    /// Returns the active endpoints and the store they write into.
    pub fn all_active_with_store(&self) -> (Vec<Endpoint>, Arc<dyn MetricStore>) {
        let active = self
            .endpoints
            .read()
            .values()
            .filter(|e| e.active)
            .map(|e| e.endpoint.clone())
            .collect();
        (active, Arc::clone(&self.store))
    }

    pub fn update_state(&self, endpoint: &Endpoint, state: &PollState) {
        let mut status = self
            .statuses
            .entry(endpoint.key().clone())
            .or_insert_with(|| EndpointStatus::new(endpoint));
        status.status = Some(state.status);
        status.last_update = Some(format_datetime(state.timestamp));
    }

    pub fn report_error(
        &self,
        endpoint: &Endpoint,
        err: Option<&anyhow::Error>,
        timestamp: SystemTime,
    ) {
        let mut status = self
            .statuses
            .entry(endpoint.key().clone())
            .or_insert_with(|| EndpointStatus::new(endpoint));
        match err {
            Some(e) => {
                status.last_error = Some(format!("{e:#}"));
                status.last_error_at = Some(format_datetime(timestamp));
            }
            None => {
                status.last_error = None;
                status.last_error_at = None;
            }
        }
    }

    pub fn log_changed_metric_count(&self, endpoint: &Endpoint, changed: usize) {
        if let Some(mut status) = self.statuses.get_mut(endpoint.key()) {
            status.changed_metrics = changed;
        }
    }

    pub fn status(&self, key: &EndpointKey) -> Option<EndpointStatus> {
        self.statuses.get(key).map(|s| s.clone())
    }

    /// Merges observed endpoints into the fleet.
    ///
    /// Newly observed apps become active endpoints. Previously observed apps
    /// that a reporting host no longer lists are retired so in-flight writes
    /// for them surface as inactive. Configured endpoints are never retired.
    pub fn update_endpoints(&self, observations: &EndpointObservations) {
        let observed = observations.get_all();
        let mut endpoints = self.endpoints.write();

        for (host, observation) in &observed {
            let instance = host_instance(&endpoints, host);

            for (app_name, port) in &observation.apps {
                let key = EndpointKey {
                    host_name: host.clone(),
                    port: *port,
                };
                match endpoints.get_mut(&key) {
                    Some(entry) => {
                        if !entry.active {
                            entry.active = true;
                            self.store.set_active(&key, true);
                            self.set_status_active(&key, true);
                            info!(endpoint = %key, app = %app_name, "endpoint reactivated");
                        }
                    }
                    None => {
                        let mut endpoint = Endpoint::new(host, *port, app_name, OBSERVED_CONNECTOR);
                        if let Some(instance) = &instance {
                            endpoint = endpoint.with_instance(instance.clone());
                        }
                        self.statuses
                            .insert(key.clone(), EndpointStatus::new(&endpoint));
                        self.store.set_active(&key, true);
                        endpoints.insert(
                            key.clone(),
                            Entry {
                                endpoint,
                                active: true,
                                observed: true,
                            },
                        );
                        info!(endpoint = %key, app = %app_name, "endpoint added");
                    }
                }
            }

            for (key, entry) in endpoints.iter_mut() {
                if !entry.observed || !entry.active || &key.host_name != host {
                    continue;
                }
                if observation.apps.get(entry.endpoint.app_name()) != Some(&key.port) {
                    entry.active = false;
                    self.store.set_active(key, false);
                    self.set_status_active(key, false);
                    info!(endpoint = %key, "endpoint retired");
                }
            }
        }
    }

    fn set_status_active(&self, key: &EndpointKey, active: bool) {
        if let Some(mut status) = self.statuses.get_mut(key) {
            status.active = active;
        }
    }
}

/// Instance metadata of any endpoint already known on `host`.
fn host_instance(endpoints: &BTreeMap<EndpointKey, Entry>, host: &str) -> Option<InstanceMeta> {
    endpoints
        .iter()
        .filter(|(key, _)| key.host_name == host)
        .find_map(|(_, entry)| entry.endpoint.instance().cloned())
}

/// Applications one host reports, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostObservation {
    pub apps: BTreeMap<String, u16>,
}

/// Latest application set reported per host.
#[derive(Debug, Default)]
pub struct EndpointObservations {
    by_host: Mutex<HashMap<String, HostObservation>>,
}

impl EndpointObservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces what `host` reports.
    pub fn save(&self, host: &str, apps: BTreeMap<String, u16>) {
        self.by_host
            .lock()
            .insert(host.to_string(), HostObservation { apps });
    }

    /// Adds an app to `host` unless it is already listed.
    pub fn maybe_add_app(&self, host: &str, app_name: &str, port: u16) {
        let mut by_host = self.by_host.lock();
        by_host
            .entry(host.to_string())
            .or_default()
            .apps
            .entry(app_name.to_string())
            .or_insert(port);
    }

    pub fn get_all(&self) -> HashMap<String, HostObservation> {
        self.by_host.lock().clone()
    }
}

/// Extracts the app set a health agent reports under "/apps/<name>/port".
pub fn apps_from_metrics(metrics: &[Metric]) -> BTreeMap<String, u16> {
    metrics
        .iter()
        .filter_map(|m| {
            let name = m.path.strip_prefix("/apps/")?.strip_suffix("/port")?;
            if name.is_empty() || name.contains('/') {
                return None;
            }
            let port = m.value.as_f64()?;
            if !(1.0..=f64::from(u16::MAX)).contains(&port) {
                return None;
            }
            Some((name.to_string(), port as u16))
        })
        .collect()
}
