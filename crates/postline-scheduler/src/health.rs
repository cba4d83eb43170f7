//! Service health snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::{JobState, JobStore};

/// Warning attached to every degraded response.
pub const STORE_UNAVAILABLE_WARNING: &str =
    "Job store not connected - scheduler features unavailable";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub name: String,
    pub connection: ConnectionState,
}

/// Point-in-time view of the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub queue: QueueInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counts: Option<BTreeMap<JobState, u64>>,
}

/// Builds [`HealthReport`]s from the store.
#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<JobStore>,
    queue_name: String,
}

impl StatusReporter {
    pub fn new(store: Arc<JobStore>, queue_name: impl Into<String>) -> Self {
        Self {
            store,
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Never fails; store errors yield the degraded view.
    pub fn snapshot(&self) -> HealthReport {
        let counts = if self.store.is_connected() {
            match self.store.counts() {
                Ok(counts) => Some(counts),
                Err(e) => {
                    warn!(error = %e, "health check could not read job counts");
                    None
                }
            }
        } else {
            None
        };

        let (status, connection, warning) = match counts {
            Some(_) => (HealthStatus::Healthy, ConnectionState::Connected, None),
            None => (
                HealthStatus::Degraded,
                ConnectionState::Disconnected,
                Some(STORE_UNAVAILABLE_WARNING.to_string()),
            ),
        };

        HealthReport {
            status,
            timestamp: Utc::now(),
            queue: QueueInfo {
                name: self.queue_name.clone(),
                connection,
            },
            warning,
            counts,
        }
    }
}
