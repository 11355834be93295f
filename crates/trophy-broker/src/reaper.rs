use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::registry::{CloseReason, ConnectionRegistry};

/// Closes connections older than a maximum age.
///
/// Runs from each connection's heartbeat tick rather than a global timer, so
/// nothing is scheduled while no client is connected.
pub struct StalenessReaper {
    registry: Arc<ConnectionRegistry>,
    max_age: Duration,
}

impl StalenessReaper {
    pub fn new(registry: Arc<ConnectionRegistry>, max_age: Duration) -> Self {
        Self { registry, max_age }
    }

    /// Reap with the configured maximum age. Returns how many were closed.
    pub fn reap(&self) -> usize {
        self.reap_at(Utc::now(), self.max_age)
    }

    /// Close every connection whose age strictly exceeds `max_age` at `now`.
    pub fn reap_at(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let reaped = self
            .registry
            .list()
            .into_iter()
            .filter(|conn| conn.age_at(now) > max_age)
            .filter(|conn| self.registry.disconnect(conn, CloseReason::Stale))
            .count();

        if reaped > 0 {
            info!(
                reaped,
                max_age_ms = max_age.as_millis() as u64,
                remaining = self.registry.count(),
                "reaped stale connections"
            );
        }
        reaped
    }
}
