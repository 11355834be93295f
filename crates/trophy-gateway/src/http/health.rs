use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health — liveness check, returns broker metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.hub.snapshot();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": snapshot.active_connections,
        "retainedEvents": state.hub.store().size(),
        "performance": snapshot,
    }))
}
