//! Graceful shutdown: wait for Ctrl-C, then close every open stream.
//!
//! Stream bodies never end on their own, so the broker must close them before
//! axum's graceful shutdown can finish draining connections.

use std::sync::Arc;

use tracing::{info, warn};
use trophy_broker::Hub;

/// Resolves once the process is asked to stop and all streams are closed.
pub async fn shutdown_signal(hub: Arc<Hub>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C, shutting down now");
    }
    info!("shutdown requested");
    close_streams(&hub);
}

/// Close every open stream and return how many were closed.
pub fn close_streams(hub: &Hub) -> usize {
    let closed = hub.shutdown();
    if closed > 0 {
        info!(closed, "closed open streams");
    }
    closed
}
