//! Live event stream — GET {stream.path}.
//!
//! Opens a Server-Sent Events response: a `connected` frame, the retained
//! history newest first (or one `empty_state` frame), then live
//! `challenge_completed` frames and a `heartbeat` every interval.
//!
//! OPTIONS answers the CORS preflight. Every other method gets a JSON 405
//! before any stream state exists.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use tracing::debug;
use trophy_core::error::{ErrorReport, TrophyError};
use trophy_protocol::payloads::ErrorBody;

use crate::app::AppState;

const LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");
const ALLOWED_METHODS: &str = "GET, OPTIONS";
const ALLOWED_HEADERS: &str = "Cache-Control, Last-Event-ID";

/// Public broadcast feed: any origin may read it.
fn cors_headers() -> [(HeaderName, &'static str); 3] {
    [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (header::ACCESS_CONTROL_ALLOW_METHODS, ALLOWED_METHODS),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, ALLOWED_HEADERS),
    ]
}

pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    match method {
        Method::GET => open_stream(&state, &headers),
        Method::OPTIONS => (StatusCode::OK, cors_headers()).into_response(),
        other => method_not_allowed(&other),
    }
}

fn open_stream(state: &Arc<AppState>, headers: &HeaderMap) -> Response {
    let last_event_id = headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from);

    let (conn, frames) = match state.hub.open_stream(last_event_id) {
        Ok(opened) => opened,
        Err(e) => {
            // already logged by the broker with its severity
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                cors_headers(),
                Json(ErrorBody::new(e.code(), "Failed to establish event stream")),
            )
                .into_response();
        }
    };
    debug!(conn_id = %conn.id(), "streaming response started");

    let body = Body::from_stream(frames.map(Ok::<_, Infallible>));
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        cors_headers(),
        body,
    )
        .into_response()
}

fn method_not_allowed(method: &Method) -> Response {
    let err = TrophyError::MethodNotAllowed {
        method: method.to_string(),
    };
    ErrorReport::from(&err).log();
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, ALLOWED_METHODS)],
        cors_headers(),
        Json(ErrorBody::new(err.code(), err.to_string())),
    )
        .into_response()
}
