use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message sent with the `empty_state` frame when there is nothing to replay.
pub const EMPTY_STATE_MESSAGE: &str = "No recent challenge completions";

/// Compact broker metrics embedded in `connected` and `heartbeat` frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub active_connections: usize,
    pub total_broadcasts: u64,
    pub last_broadcast_at: Option<DateTime<Utc>>,
    pub average_connection_age_ms: u64,
}

/// `connected` — first frame on every stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub connection_id: String,
    pub connected_at: DateTime<Utc>,
    pub active_connections: usize,
    pub performance: PerformanceSummary,
}

/// `heartbeat` — periodic keepalive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub timestamp: DateTime<Utc>,
    pub active_connections: usize,
    pub performance: PerformanceSummary,
}

/// `empty_state` — replay found no retained events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmptyStatePayload {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl EmptyStatePayload {
    pub fn now() -> Self {
        Self {
            message: EMPTY_STATE_MESSAGE.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// JSON body for requests rejected before the stream starts.
/// Wire: `{ "error": "...", "code": "METHOD_NOT_ALLOWED", "timestamp": "..." }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorBody {
    pub fn new(code: &str, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.to_string(),
            timestamp: Utc::now(),
        }
    }
}
