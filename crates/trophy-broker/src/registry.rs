//! Live connection registry and per-connection metrics.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use trophy_core::types::ConnectionId;
use trophy_protocol::payloads::PerformanceSummary;

use crate::error::{BrokerError, SinkError};
use crate::sink::EventSink;

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Transport dropped the response body.
    ClientDisconnected,
    /// A broadcast write failed.
    WriteFailed,
    /// A heartbeat write failed.
    HeartbeatFailed,
    /// Older than the configured maximum age.
    Stale,
    /// Server shutting down.
    Shutdown,
    /// Never admitted to the registry.
    Rejected,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientDisconnected => write!(f, "client-disconnected"),
            Self::WriteFailed => write!(f, "write-failed"),
            Self::HeartbeatFailed => write!(f, "heartbeat-failed"),
            Self::Stale => write!(f, "stale"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// One open stream.
///
/// Lifecycle is `Connecting → Streaming → Closed`. The first teardown wins:
/// [`Connection::begin_close`] flips a flag exactly once, and the `closed`
/// token wakes the heartbeat task no matter which path closed the stream.
pub struct Connection {
    id: ConnectionId,
    sink: Box<dyn EventSink>,
    last_event_id: Option<String>,
    connected_at: DateTime<Utc>,
    messages_sent: AtomicU64,
    last_activity_ms: AtomicI64,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(id: ConnectionId, sink: Box<dyn EventSink>, last_event_id: Option<String>) -> Self {
        Self::with_closed_signal(id, sink, last_event_id, CancellationToken::new())
    }

    /// Build a connection whose closed signal is shared with the transport.
    pub fn with_closed_signal(
        id: ConnectionId,
        sink: Box<dyn EventSink>,
        last_event_id: Option<String>,
        closed: CancellationToken,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            sink,
            last_event_id,
            connected_at: now,
            messages_sent: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            closing: AtomicBool::new(false),
            closed,
        }
    }

    /// Override the establishment time.
    pub fn connected_since(mut self, at: DateTime<Utc>) -> Self {
        self.connected_at = at;
        self.last_activity_ms = AtomicI64::new(at.timestamp_millis());
        self
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms)
            .single()
            .unwrap_or(self.connected_at)
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.connected_at).to_std().unwrap_or_default()
    }

    /// Write one encoded frame. Fails once the connection is closing.
    pub fn send(&self, frame: &Bytes) -> Result<(), SinkError> {
        if self.is_closed() {
            return Err(SinkError::Closed);
        }
        self.sink.write(frame.clone())?;
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Token cancelled once the stream is closed from either side.
    pub fn closed_signal(&self) -> &CancellationToken {
        &self.closed
    }

    /// Returns true only for the first caller.
    fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected_at", &self.connected_at)
            .field("messages_sent", &self.messages_sent())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Per-connection entry in a [`PerformanceSnapshot`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub connection_id: String,
    pub connected_at: DateTime<Utc>,
    pub age_ms: u64,
    pub messages_sent: u64,
    pub last_activity_at: DateTime<Utc>,
}

/// Read-only aggregate computed on demand; never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSnapshot {
    pub active_connections: usize,
    pub total_broadcasts: u64,
    pub last_broadcast_at: Option<DateTime<Utc>>,
    pub average_connection_age_ms: u64,
    pub connections: Vec<ConnectionStats>,
}

impl PerformanceSnapshot {
    /// Compact form embedded in stream frames.
    pub fn summary(&self) -> PerformanceSummary {
        PerformanceSummary {
            active_connections: self.active_connections,
            total_broadcasts: self.total_broadcasts,
            last_broadcast_at: self.last_broadcast_at,
            average_connection_age_ms: self.average_connection_age_ms,
        }
    }
}

/// Every open stream, keyed by connection id.
///
/// `list()` returns a point-in-time copy so callers can write to connections
/// without holding any map lock.
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
    broadcasts: AtomicU64,
    last_broadcast_at: Mutex<Option<DateTime<Utc>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            broadcasts: AtomicU64::new(0),
            last_broadcast_at: Mutex::new(None),
        }
    }

    pub fn add(&self, conn: Arc<Connection>) -> Result<(), BrokerError> {
        match self.connections.entry(conn.id().to_string()) {
            Entry::Occupied(_) => Err(BrokerError::DuplicateConnection {
                id: conn.id().to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(conn);
                Ok(())
            }
        }
    }

    /// Deregister. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.remove(id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    pub fn list(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Tear a connection down: deregister, close its sink, fire its closed
    /// signal. Only the first call for a given connection does anything.
    pub fn disconnect(&self, conn: &Connection, reason: CloseReason) -> bool {
        if !conn.begin_close() {
            return false;
        }
        // only this exact connection; a rejected duplicate must not evict the original
        self.connections
            .remove_if(conn.id().as_str(), |_, registered| {
                std::ptr::eq(Arc::as_ptr(registered), conn)
            });
        conn.sink.close();
        conn.closed.cancel();
        info!(
            conn_id = %conn.id(),
            reason = %reason,
            messages = conn.messages_sent(),
            remaining = self.count(),
            "stream closed"
        );
        true
    }

    pub fn record_broadcast(&self, at: DateTime<Utc>) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        *self
            .last_broadcast_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    pub fn total_broadcasts(&self) -> u64 {
        self.broadcasts.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> PerformanceSnapshot {
        let mut connections: Vec<ConnectionStats> = self
            .list()
            .iter()
            .map(|c| ConnectionStats {
                connection_id: c.id().to_string(),
                connected_at: c.connected_at(),
                age_ms: c.age_at(now).as_millis() as u64,
                messages_sent: c.messages_sent(),
                last_activity_at: c.last_activity_at(),
            })
            .collect();
        connections.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));

        let average_connection_age_ms = if connections.is_empty() {
            0
        } else {
            connections.iter().map(|c| c.age_ms).sum::<u64>() / connections.len() as u64
        };

        PerformanceSnapshot {
            active_connections: connections.len(),
            total_broadcasts: self.total_broadcasts(),
            last_broadcast_at: *self
                .last_broadcast_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            average_connection_age_ms,
            connections,
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::MemorySink;
    use chrono::TimeDelta;

    fn conn(id: &str) -> (Arc<Connection>, Arc<MemorySink>) {
        let sink = MemorySink::new();
        let conn = Connection::new(ConnectionId::from(id), Box::new(Arc::clone(&sink)), None);
        (Arc::new(conn), sink)
    }

    #[test]
    fn add_rejects_duplicate_id() {
        let registry = ConnectionRegistry::new();
        registry.add(conn("c1").0).unwrap();
        let err = registry.add(conn("c1").0).unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_CONNECTION");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        registry.add(conn("c1").0).unwrap();
        assert!(registry.remove("c1").is_some());
        assert!(registry.remove("c1").is_none());
        assert!(registry.remove("never-added").is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn disconnect_runs_once_from_any_number_of_paths() {
        let registry = ConnectionRegistry::new();
        let (keep, _) = conn("keep");
        let (c, sink) = conn("c1");
        registry.add(keep).unwrap();
        registry.add(Arc::clone(&c)).unwrap();
        assert_eq!(registry.count(), 2);

        let results = [
            registry.disconnect(&c, CloseReason::ClientDisconnected),
            registry.disconnect(&c, CloseReason::WriteFailed),
            registry.disconnect(&c, CloseReason::HeartbeatFailed),
            registry.disconnect(&c, CloseReason::ClientDisconnected),
        ];
        assert_eq!(results.iter().filter(|r| **r).count(), 1);
        assert_eq!(registry.count(), 1);
        assert!(sink.is_closed());
        assert!(c.closed_signal().is_cancelled());
    }

    #[test]
    fn closing_a_rejected_duplicate_keeps_the_original() {
        let registry = ConnectionRegistry::new();
        let (original, _) = conn("c1");
        let (duplicate, dup_sink) = conn("c1");
        registry.add(Arc::clone(&original)).unwrap();
        assert!(registry.add(Arc::clone(&duplicate)).is_err());

        assert!(registry.disconnect(&duplicate, CloseReason::Rejected));
        assert!(dup_sink.is_closed());
        assert_eq!(registry.count(), 1);
        assert!(!original.is_closed());
    }

    #[test]
    fn send_counts_messages_and_stops_after_close() {
        let registry = ConnectionRegistry::new();
        let (c, _) = conn("c1");
        registry.add(Arc::clone(&c)).unwrap();

        c.send(&Bytes::from_static(b"x")).unwrap();
        c.send(&Bytes::from_static(b"y")).unwrap();
        assert_eq!(c.messages_sent(), 2);

        registry.disconnect(&c, CloseReason::Shutdown);
        assert_eq!(c.send(&Bytes::from_static(b"z")), Err(SinkError::Closed));
        assert_eq!(c.messages_sent(), 2);
    }

    #[test]
    fn snapshot_aggregates_ages_and_broadcasts() {
        let registry = ConnectionRegistry::new();
        let now = Utc::now();
        for (id, age) in [("a", 10), ("b", 30)] {
            let c = Connection::new(ConnectionId::from(id), Box::new(MemorySink::new()), None)
                .connected_since(now - TimeDelta::seconds(age));
            registry.add(Arc::new(c)).unwrap();
        }
        registry.record_broadcast(now);
        registry.record_broadcast(now);

        let snap = registry.snapshot_at(now);
        assert_eq!(snap.active_connections, 2);
        assert_eq!(snap.total_broadcasts, 2);
        assert_eq!(snap.last_broadcast_at, Some(now));
        assert_eq!(snap.average_connection_age_ms, 20_000);
        assert_eq!(snap.connections[0].connection_id, "b");
        assert_eq!(snap.summary().active_connections, 2);
    }
}
