use std::collections::HashMap;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::format_datetime;

use super::{Endpoint, EndpointKey};

/// Most recent poll error of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionError {
    pub host_name: String,
    pub timestamp: String,
    pub error: String,
}

/// Current poll error per endpoint.
///
/// Every operation takes the lock once and never holds it across I/O.
#[derive(Debug, Default)]
pub struct ConnectionErrors {
    by_endpoint: Mutex<HashMap<EndpointKey, ConnectionError>>,
}

impl ConnectionErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records or overwrites the error for an endpoint.
    pub fn set(&self, endpoint: &Endpoint, err: &anyhow::Error, timestamp: SystemTime) {
        let entry = ConnectionError {
            host_name: endpoint.host_name().to_string(),
            timestamp: format_datetime(timestamp),
            error: format!("{err:#}"),
        };
        self.by_endpoint.lock().insert(endpoint.key().clone(), entry);
    }

    /// Forgets the error for an endpoint.
    pub fn clear(&self, endpoint: &Endpoint) {
        self.by_endpoint.lock().remove(endpoint.key());
    }

    /// Point-in-time copy of all errors, ordered by host name.
    pub fn get_errors(&self) -> Vec<ConnectionError> {
        let mut result: Vec<ConnectionError> =
            self.by_endpoint.lock().values().cloned().collect();
        result.sort_by(|a, b| a.host_name.cmp(&b.host_name));
        result
    }
}
