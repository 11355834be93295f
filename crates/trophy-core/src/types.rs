use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a published event (UUIDv7, time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier for one open stream.
///
/// Format: `conn_{unix_millis}_{random}`. The timestamp prefix keeps ids
/// readable in logs; the random suffix makes collisions negligible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn generate() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "conn_{}_{}",
            Utc::now().timestamp_millis(),
            &suffix[..12]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A player finished a challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeCompletion {
    pub player_id: String,
    pub player_name: String,
    pub challenge_id: String,
    pub challenge_name: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<i64>,
}

/// Event body, tagged by kind. New kinds are added as variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    ChallengeCompleted(ChallengeCompletion),
}

impl EventPayload {
    /// Wire name of the kind, used as the SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::ChallengeCompleted(_) => "challenge_completed",
        }
    }
}

/// An immutable published occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    #[serde(flatten)]
    pub payload: EventPayload,
    /// Publish time; drives retention and replay ordering.
    pub published_at: DateTime<Utc>,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self::with_id(EventId::new(), payload, Utc::now())
    }

    pub fn with_id(id: EventId, payload: EventPayload, published_at: DateTime<Utc>) -> Self {
        Self {
            id,
            payload,
            published_at,
        }
    }

    pub fn challenge_completed(completion: ChallengeCompletion) -> Self {
        Self::new(EventPayload::ChallengeCompleted(completion))
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}
