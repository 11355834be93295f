use axum::{
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use trophy_broker::Hub;
use trophy_core::config::TrophyConfig;

/// Shared state handed to every Axum handler as `Arc<AppState>`.
pub struct AppState {
    pub config: TrophyConfig,
    /// The process-wide broker: event store, connection registry, fan-out.
    pub hub: Arc<Hub>,
}

impl AppState {
    pub fn new(config: TrophyConfig) -> Self {
        let hub = Arc::new(Hub::from_config(&config));
        Self { config, hub }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let stream_path = state.config.stream.path.clone();
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        // method checks live in the handler so the 405 body is ours
        .route(&stream_path, any(crate::http::stream::stream_handler))
        .route(
            "/webhooks/{source}",
            post(crate::http::webhooks::webhook_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
