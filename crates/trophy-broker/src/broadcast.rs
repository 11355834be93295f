//! Fan-out of one event to every registered stream.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tracing::debug;
use trophy_core::error::{ErrorCategory, ErrorReport, Severity, TrophyError};
use trophy_core::types::Event;
use trophy_protocol::SseFrame;

use crate::registry::{CloseReason, Connection, ConnectionRegistry};

/// Outcome of one fan-out. Delivery means "queued to the client's stream".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReport {
    pub event_id: String,
    pub delivered: usize,
    pub failed: usize,
}

/// Serializes each event once and writes the frame to every connection.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver `event` to every connection registered right now.
    ///
    /// A failed write only drops that connection; the loop always finishes.
    /// Failed connections are torn down after the loop, never during it.
    pub fn broadcast(&self, event: &Event) -> BroadcastReport {
        let frame = encode_frame(SseFrame::event(event), event.id.as_str(), event.kind());
        let connections = self.registry.list();

        let mut delivered = 0usize;
        let mut failed: Vec<Arc<Connection>> = Vec::new();
        for conn in &connections {
            match conn.send(&frame) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(conn_id = %conn.id(), event_id = %event.id, error = %e, "broadcast write failed");
                    failed.push(Arc::clone(conn));
                }
            }
        }

        for conn in &failed {
            self.registry.disconnect(conn, CloseReason::WriteFailed);
        }

        self.registry.record_broadcast(Utc::now());

        if !failed.is_empty() {
            ErrorReport::new(
                ErrorCategory::Broadcast,
                "BROADCAST_PARTIAL",
                Severity::Low,
                format!("{} of {} writes failed", failed.len(), connections.len()),
            )
            .with_context(serde_json::json!({
                "eventId": event.id.as_str(),
                "failed": failed.len(),
                "delivered": delivered,
            }))
            .log();
        }

        debug!(event_id = %event.id, delivered, failed = failed.len(), "broadcast complete");

        BroadcastReport {
            event_id: event.id.to_string(),
            delivered,
            failed: failed.len(),
        }
    }
}

/// Encode a frame, substituting a minimal error payload when the real one
/// could not be serialized.
pub(crate) fn encode_frame(
    frame: Result<SseFrame, serde_json::Error>,
    id: &str,
    event: &str,
) -> Bytes {
    match frame {
        Ok(frame) => frame.encode(),
        Err(e) => {
            let err = TrophyError::from(e);
            ErrorReport::from(&err)
                .with_context(serde_json::json!({ "id": id, "event": event }))
                .log();
            SseFrame::fallback(id, event, &err.to_string()).encode()
        }
    }
}
