//! Broker composition root: publish entry point and stream lifecycle.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use trophy_core::config::{StoreConfig, StreamConfig, TrophyConfig};
use trophy_core::types::{ChallengeCompletion, ConnectionId, Event, EventId};
use trophy_protocol::frames::{
    empty_state_id, heartbeat_id, EVENT_CONNECTED, EVENT_EMPTY_STATE, EVENT_HEARTBEAT,
};
use trophy_protocol::payloads::{ConnectedPayload, EmptyStatePayload, HeartbeatPayload};
use trophy_protocol::SseFrame;

use crate::broadcast::{encode_frame, BroadcastReport, Broadcaster};
use crate::error::BrokerError;
use crate::reaper::StalenessReaper;
use crate::registry::{CloseReason, Connection, ConnectionRegistry, PerformanceSnapshot};
use crate::sink::{ChannelSink, FrameStream};
use crate::store::EventStore;

/// One instance per process, shared as `Arc<Hub>` with the HTTP layer.
pub struct Hub {
    store: EventStore,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Broadcaster,
    reaper: StalenessReaper,
    heartbeat_interval: Duration,
    send_buffer: usize,
    replay_limit: usize,
}

impl Hub {
    pub fn new(stream: &StreamConfig, store: &StoreConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            store: EventStore::from_config(store),
            broadcaster: Broadcaster::new(Arc::clone(&registry)),
            reaper: StalenessReaper::new(Arc::clone(&registry), stream.max_connection_age()),
            registry,
            heartbeat_interval: stream.heartbeat_interval(),
            send_buffer: stream.send_buffer,
            replay_limit: store.max_events.max(1),
        }
    }

    pub fn from_config(config: &TrophyConfig) -> Self {
        Self::new(&config.stream, &config.store)
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    // ── Publisher API ───────────────────────────────────────────────────────

    /// Record `event` and fan it out to every open stream.
    ///
    /// Completes once every write has been attempted; it does not wait for
    /// clients to read anything.
    pub fn publish(&self, event: Event) -> Result<BroadcastReport, BrokerError> {
        if !self.store.append_unique(event.clone()) {
            let err = BrokerError::DuplicateEvent {
                id: event.id.to_string(),
            };
            err.report().log();
            return Err(err);
        }
        let report = self.broadcaster.broadcast(&event);
        info!(
            event_id = %event.id,
            kind = event.kind(),
            delivered = report.delivered,
            failed = report.failed,
            "event published"
        );
        Ok(report)
    }

    /// Publish a completion under a fresh event id.
    pub fn publish_completion(
        &self,
        completion: ChallengeCompletion,
    ) -> Result<BroadcastReport, BrokerError> {
        self.publish(Event::challenge_completed(completion))
    }

    // ── Stream lifecycle ────────────────────────────────────────────────────

    /// Open a channel-backed stream: queue the `connected` frame, register
    /// it, queue history, start its heartbeat.
    ///
    /// The returned [`FrameStream`] is the response body. Dropping it closes
    /// the connection.
    pub fn open_stream(
        self: &Arc<Self>,
        last_event_id: Option<String>,
    ) -> Result<(Arc<Connection>, FrameStream), BrokerError> {
        let closed = CancellationToken::new();
        // the store never holds more than replay_limit events, so a full
        // replay plus connected/empty_state always fits on top of the live buffer
        let capacity = self.send_buffer + self.replay_limit + 2;
        let (sink, stream) = ChannelSink::pair(capacity, closed.clone());
        let conn = Arc::new(Connection::with_closed_signal(
            ConnectionId::generate(),
            Box::new(sink),
            last_event_id,
            closed,
        ));
        self.accept(Arc::clone(&conn))?;
        Ok((conn, stream))
    }

    /// Bring an already-built connection to streaming state.
    ///
    /// `connected` is queued before registration so no broadcast can overtake
    /// it. History is read after registration, so an event published
    /// meanwhile lands in the replay, the live fan-out, or both.
    ///
    /// Registration failure is the only error. A failed replay write stops the
    /// replay and leaves cleanup to the heartbeat.
    pub fn accept(self: &Arc<Self>, conn: Arc<Connection>) -> Result<(), BrokerError> {
        if let Err(e) = conn.send(&self.connected_frame(&conn)) {
            e.report(conn.id().as_str()).log();
            // presumed dead before streaming began
            self.disconnect(&conn, CloseReason::WriteFailed);
            return Ok(());
        }

        if let Err(e) = self.registry.add(Arc::clone(&conn)) {
            e.report().log();
            self.disconnect(&conn, CloseReason::Rejected);
            return Err(e);
        }

        let history = self.replay_history(conn.last_event_id());
        info!(
            conn_id = %conn.id(),
            last_event_id = conn.last_event_id().unwrap_or("-"),
            replay = history.len(),
            active = self.registry.count(),
            "stream opened"
        );
        self.write_replay(&conn, &history);

        tokio::spawn(crate::heartbeat::run(
            Arc::clone(self),
            Arc::clone(&conn),
            self.heartbeat_interval,
        ));
        Ok(())
    }

    /// Events a new subscriber should see, newest first.
    ///
    /// A `Last-Event-ID` naming a retained event resumes after it; anything
    /// else replays the whole retention window.
    pub fn replay_history(&self, last_event_id: Option<&str>) -> Vec<Event> {
        let anchor = last_event_id.and_then(|id| self.store.get(&EventId::from(id)));
        match anchor {
            Some(anchor) => self
                .store
                .query(Some(anchor.published_at))
                .into_iter()
                .filter(|e| e.id != anchor.id)
                .collect(),
            None => self.store.query(None),
        }
    }

    /// Idempotent teardown shared by every close path.
    pub fn disconnect(&self, conn: &Connection, reason: CloseReason) -> bool {
        self.registry.disconnect(conn, reason)
    }

    pub fn reap(&self) -> usize {
        self.reaper.reap()
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        self.registry.snapshot()
    }

    /// Close every open stream. Returns how many were closed.
    pub fn shutdown(&self) -> usize {
        let closed = self
            .registry
            .list()
            .into_iter()
            .filter(|conn| self.registry.disconnect(conn, CloseReason::Shutdown))
            .count();
        info!(closed, "broker shut down");
        closed
    }

    // ── Frames ──────────────────────────────────────────────────────────────

    /// History newest first, or a single `empty_state` when there is none.
    fn write_replay(&self, conn: &Connection, history: &[Event]) {
        if history.is_empty() {
            if let Err(e) = conn.send(&empty_state_frame()) {
                e.report(conn.id().as_str()).log();
            }
            return;
        }

        for (sent, event) in history.iter().enumerate() {
            let frame = encode_frame(SseFrame::event(event), event.id.as_str(), event.kind());
            if let Err(e) = conn.send(&frame) {
                warn!(
                    conn_id = %conn.id(),
                    sent,
                    total = history.len(),
                    error = %e,
                    "replay interrupted"
                );
                break;
            }
        }
    }

    /// Counts include `conn` itself, which is registered right after this
    /// frame is queued.
    fn connected_frame(&self, conn: &Connection) -> Bytes {
        let mut performance = self.registry.snapshot().summary();
        performance.active_connections += 1;
        let payload = ConnectedPayload {
            connection_id: conn.id().to_string(),
            connected_at: conn.connected_at(),
            active_connections: performance.active_connections,
            performance,
        };
        encode_frame(SseFrame::connected(&payload), conn.id().as_str(), EVENT_CONNECTED)
    }

    pub(crate) fn heartbeat_frame(&self) -> Bytes {
        let snapshot = self.registry.snapshot();
        let payload = HeartbeatPayload {
            timestamp: Utc::now(),
            active_connections: snapshot.active_connections,
            performance: snapshot.summary(),
        };
        let id = heartbeat_id(payload.timestamp);
        encode_frame(SseFrame::heartbeat(&payload), &id, EVENT_HEARTBEAT)
    }
}

fn empty_state_frame() -> Bytes {
    let payload = EmptyStatePayload::now();
    let id = empty_state_id(payload.timestamp);
    encode_frame(SseFrame::empty_state(&payload), &id, EVENT_EMPTY_STATE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::MemorySink;
    use chrono::TimeDelta;
    use trophy_core::types::EventPayload;

    fn hub_with(heartbeat_ms: u64) -> Arc<Hub> {
        let stream = StreamConfig {
            heartbeat_interval_ms: heartbeat_ms,
            ..StreamConfig::default()
        };
        Arc::new(Hub::new(&stream, &StoreConfig::default()))
    }

    fn completion(player: &str) -> ChallengeCompletion {
        ChallengeCompletion {
            player_id: player.into(),
            player_name: player.to_uppercase(),
            challenge_id: "c1".into(),
            challenge_name: "Daily".into(),
            completed_at: Utc::now(),
            points: None,
        }
    }

    fn event(id: &str, at: chrono::DateTime<Utc>) -> Event {
        Event::with_id(
            EventId::from(id),
            EventPayload::ChallengeCompleted(completion("p1")),
            at,
        )
    }

    fn attach(hub: &Arc<Hub>, last_event_id: Option<&str>) -> (Arc<Connection>, Arc<MemorySink>) {
        let sink = MemorySink::new();
        let conn = Arc::new(Connection::new(
            ConnectionId::generate(),
            Box::new(Arc::clone(&sink)),
            last_event_id.map(String::from),
        ));
        hub.accept(Arc::clone(&conn)).unwrap();
        (conn, sink)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn empty_store_sends_single_empty_state() {
        let hub = hub_with(60_000);
        let (conn, sink) = attach(&hub, None);

        let frames = sink.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, "connected");
        let connected: ConnectedPayload = frames[0].decode().unwrap();
        assert_eq!(connected.connection_id, conn.id().to_string());
        assert_eq!(connected.active_connections, 1);

        assert_eq!(sink.events_named("empty_state").len(), 1);
        assert!(sink.events_named("challenge_completed").is_empty());
    }

    #[tokio::test]
    async fn replay_is_newest_first() {
        let hub = hub_with(60_000);
        let t = Utc::now() - TimeDelta::seconds(10);
        hub.publish(event("t1", t)).unwrap();
        hub.publish(event("t2", t + TimeDelta::seconds(1))).unwrap();
        hub.publish(event("t3", t + TimeDelta::seconds(2))).unwrap();

        let (_, sink) = attach(&hub, None);
        let replayed: Vec<String> = sink
            .events_named("challenge_completed")
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(replayed, vec!["t3", "t2", "t1"]);
        assert!(sink.events_named("empty_state").is_empty());
    }

    #[tokio::test]
    async fn last_event_id_resumes_after_that_event() {
        let hub = hub_with(60_000);
        let t = Utc::now() - TimeDelta::seconds(10);
        hub.publish(event("t1", t)).unwrap();
        hub.publish(event("t2", t + TimeDelta::seconds(1))).unwrap();
        hub.publish(event("t3", t + TimeDelta::seconds(2))).unwrap();

        let resumed: Vec<String> = hub
            .replay_history(Some("t2"))
            .into_iter()
            .map(|e| e.id.to_string())
            .collect();
        assert_eq!(resumed, vec!["t3"]);

        // unknown id falls back to the full window
        assert_eq!(hub.replay_history(Some("gone")).len(), 3);
    }

    #[tokio::test]
    async fn publish_reaches_open_streams_and_rejects_duplicates() {
        let hub = hub_with(60_000);
        let (_, a) = attach(&hub, None);
        let (_, b) = attach(&hub, None);

        let report = hub.publish(event("e1", Utc::now())).unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(a.events_named("challenge_completed").len(), 1);
        assert_eq!(b.events_named("challenge_completed").len(), 1);

        let err = hub.publish(event("e1", Utc::now())).unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_EVENT");
        assert_eq!(hub.store().size(), 1);
    }

    #[tokio::test]
    async fn publish_completion_assigns_fresh_ids() {
        let hub = hub_with(60_000);
        let first = hub.publish_completion(completion("p1")).unwrap();
        let second = hub.publish_completion(completion("p1")).unwrap();
        assert_ne!(first.event_id, second.event_id);
        assert_eq!(hub.store().size(), 2);
    }

    #[tokio::test]
    async fn duplicate_connection_id_is_rejected() {
        let hub = hub_with(60_000);
        let id = ConnectionId::from("fixed");
        let first = Arc::new(Connection::new(id.clone(), Box::new(MemorySink::new()), None));
        let second = Arc::new(Connection::new(id, Box::new(MemorySink::new()), None));

        hub.accept(Arc::clone(&first)).unwrap();
        let err = hub.accept(Arc::clone(&second)).unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_CONNECTION");
        assert_eq!(hub.registry().count(), 1);
        assert!(second.is_closed());
        assert!(!first.is_closed());
    }

    #[tokio::test]
    async fn event_published_before_accept_is_replayed() {
        let hub = hub_with(60_000);
        let sink = MemorySink::new();
        let conn = Arc::new(Connection::new(
            ConnectionId::generate(),
            Box::new(Arc::clone(&sink)),
            None,
        ));

        // lands after the stream was built but before it is registered
        hub.publish(event("race", Utc::now())).unwrap();
        hub.accept(conn).unwrap();

        let ids: Vec<String> = sink
            .events_named("challenge_completed")
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, vec!["race"]);
        assert!(sink.events_named("empty_state").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_publishes_reach_every_new_stream() {
        use std::collections::HashSet;

        let hub = hub_with(60_000);
        let publisher = {
            let hub = Arc::clone(&hub);
            std::thread::spawn(move || {
                for i in 0..200 {
                    hub.publish(event(&format!("c{i}"), Utc::now())).unwrap();
                }
            })
        };

        let sinks: Vec<Arc<MemorySink>> = (0..20).map(|_| attach(&hub, None).1).collect();
        publisher.join().unwrap();

        for sink in &sinks {
            let seen: HashSet<String> = sink
                .events_named("challenge_completed")
                .into_iter()
                .map(|f| f.id)
                .collect();
            assert_eq!(seen.len(), 200);
        }
        hub.shutdown();
    }

    #[tokio::test]
    async fn connected_is_queued_before_registration() {
        use crate::error::SinkError;
        use crate::sink::EventSink;
        use std::sync::Mutex;

        /// Records how many connections were registered at each write.
        struct RegistryWatch {
            registry: Arc<ConnectionRegistry>,
            counts: Mutex<Vec<usize>>,
        }

        impl EventSink for RegistryWatch {
            fn write(&self, _frame: Bytes) -> Result<(), SinkError> {
                self.counts.lock().unwrap().push(self.registry.count());
                Ok(())
            }

            fn close(&self) {}
        }

        let hub = hub_with(60_000);
        let watch = Arc::new(RegistryWatch {
            registry: Arc::clone(hub.registry()),
            counts: Mutex::new(Vec::new()),
        });
        let conn = Arc::new(Connection::new(
            ConnectionId::generate(),
            Box::new(Arc::clone(&watch)),
            None,
        ));
        hub.accept(conn).unwrap();

        // connected, then empty_state
        assert_eq!(*watch.counts.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn replay_failure_leaves_cleanup_to_heartbeat() {
        let hub = hub_with(50);
        let t = Utc::now() - TimeDelta::seconds(10);
        hub.publish(event("t1", t)).unwrap();
        hub.publish(event("t2", t + TimeDelta::seconds(1))).unwrap();
        hub.publish(event("t3", t + TimeDelta::seconds(2))).unwrap();

        // connected plus one replayed event, then the buffer is "full"
        let sink = MemorySink::failing_after(2);
        let conn = Arc::new(Connection::new(
            ConnectionId::generate(),
            Box::new(Arc::clone(&sink)),
            None,
        ));
        hub.accept(Arc::clone(&conn)).unwrap();

        let replayed: Vec<String> = sink
            .events_named("challenge_completed")
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(replayed, vec!["t3"]);
        assert_eq!(hub.registry().count(), 1);
        assert!(!conn.is_closed());

        assert!(wait_until(|| hub.registry().count() == 0).await);
        assert!(conn.is_closed());
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn zero_heartbeat_interval_still_ticks() {
        let hub = hub_with(0);
        let (conn, sink) = attach(&hub, None);

        assert!(wait_until(|| !sink.events_named("heartbeat").is_empty()).await);
        assert_eq!(hub.registry().count(), 1);
        assert!(!conn.is_closed());
        hub.shutdown();
    }

    #[tokio::test]
    async fn full_replay_fits_the_stream_buffer() {
        use tokio_stream::StreamExt;

        let stream = StreamConfig {
            send_buffer: 0,
            ..StreamConfig::default()
        };
        let store = StoreConfig {
            max_events: 5,
            ..StoreConfig::default()
        };
        let hub = Arc::new(Hub::new(&stream, &store));
        let t = Utc::now() - TimeDelta::seconds(10);
        for i in 0..5 {
            hub.publish(event(&format!("e{i}"), t + TimeDelta::seconds(i))).unwrap();
        }

        let (conn, mut body) = hub.open_stream(None).unwrap();
        let mut text = String::new();
        for _ in 0..6 {
            let chunk = body.next().await.unwrap();
            text.push_str(std::str::from_utf8(&chunk).unwrap());
        }
        let frames = trophy_protocol::parse_stream(&text);
        assert_eq!(frames[0].event, "connected");
        assert_eq!(frames.iter().filter(|f| f.event == "challenge_completed").count(), 5);
        assert!(!conn.is_closed());
        assert_eq!(hub.registry().count(), 1);
    }

    #[tokio::test]
    async fn heartbeat_writes_frames_until_write_fails() {
        let hub = hub_with(20);
        let (_, sink) = attach(&hub, None);

        assert!(wait_until(|| !sink.events_named("heartbeat").is_empty()).await);
        assert_eq!(hub.registry().count(), 1);

        sink.set_failing(true);
        assert!(wait_until(|| hub.registry().count() == 0).await);
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn transport_close_deregisters_without_heartbeat() {
        let hub = hub_with(60_000);
        let before = hub.registry().count();
        let (conn, _) = attach(&hub, None);
        assert_eq!(hub.registry().count(), before + 1);

        conn.closed_signal().cancel();
        assert!(wait_until(|| hub.registry().count() == before).await);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn teardown_paths_collapse_to_one() {
        let hub = hub_with(60_000);
        let (conn, _) = attach(&hub, None);
        let (_other, _) = attach(&hub, None);

        let performed = [
            hub.disconnect(&conn, CloseReason::ClientDisconnected),
            hub.disconnect(&conn, CloseReason::WriteFailed),
        ];
        conn.closed_signal().cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(performed, [true, false]);
        assert_eq!(hub.registry().count(), 1);
    }

    #[tokio::test]
    async fn open_stream_queues_handshake_on_the_body() {
        use tokio_stream::StreamExt;

        let hub = hub_with(60_000);
        let (conn, mut body) = hub.open_stream(None).unwrap();
        let first = body.next().await.unwrap();
        let text = String::from_utf8(first.to_vec()).unwrap();
        assert!(text.starts_with(&format!("id: {}\nevent: connected\n", conn.id())));

        drop(body);
        assert!(wait_until(|| hub.registry().count() == 0).await);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let hub = hub_with(60_000);
        let (_, a) = attach(&hub, None);
        let (_, b) = attach(&hub, None);

        assert_eq!(hub.shutdown(), 2);
        assert_eq!(hub.registry().count(), 0);
        assert!(a.is_closed() && b.is_closed());
    }
}
