use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PruneConfig;
use crate::retry::seconds;

/// Liveness record for a connected execution agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    id: String,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
}

impl Worker {
    /// A worker with no recorded activity yet.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            first_seen: None,
            last_active: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Record activity at `now`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.first_seen.get_or_insert(now);
        self.last_active = Some(now);
    }

    /// Whether the worker has been silent for longer than the disconnect delay.
    ///
    /// A worker without recorded activity is never prunable.
    pub fn should_prune<C: PruneConfig + ?Sized>(&self, config: &C, now: DateTime<Utc>) -> bool {
        match self.last_active {
            Some(last) => now.signed_duration_since(last) > seconds(config.worker_disconnect_delay()),
            None => false,
        }
    }
}
