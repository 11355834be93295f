use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::hub::Hub;
use crate::registry::{CloseReason, Connection};

/// Per-connection keepalive loop, alive for the whole stream.
///
/// Each tick reaps stale connections, then writes a heartbeat frame. The loop
/// ends on the first of: the connection's closed signal, this connection
/// being reaped, or a failed heartbeat write.
pub(crate) async fn run(hub: Arc<Hub>, conn: Arc<Connection>, period: Duration) {
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let closed = conn.closed_signal().clone();

    loop {
        tokio::select! {
            biased;

            _ = closed.cancelled() => {
                // no-op when teardown started elsewhere
                hub.disconnect(&conn, CloseReason::ClientDisconnected);
                break;
            }

            _ = tick.tick() => {
                hub.reap();
                if conn.is_closed() {
                    break;
                }
                let frame = hub.heartbeat_frame();
                if let Err(e) = conn.send(&frame) {
                    e.report(conn.id().as_str()).log();
                    hub.disconnect(&conn, CloseReason::HeartbeatFailed);
                    break;
                }
            }
        }
    }

    debug!(conn_id = %conn.id(), "heartbeat stopped");
}
