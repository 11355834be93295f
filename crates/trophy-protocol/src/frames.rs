use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use trophy_core::types::Event;

use crate::payloads::{ConnectedPayload, EmptyStatePayload, HeartbeatPayload};

pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_CHALLENGE_COMPLETED: &str = "challenge_completed";
pub const EVENT_EMPTY_STATE: &str = "empty_state";
pub const EVENT_HEARTBEAT: &str = "heartbeat";

/// Synthetic id for a `heartbeat` frame sent at `at`.
pub fn heartbeat_id(at: DateTime<Utc>) -> String {
    format!("heartbeat-{}", at.timestamp_millis())
}

/// Synthetic id for an `empty_state` frame sent at `at`.
pub fn empty_state_id(at: DateTime<Utc>) -> String {
    format!("empty-{}", at.timestamp_millis())
}

/// One Server-Sent Events message.
///
/// Wire:
/// ```text
/// id: <id>
/// event: <event>
/// data: <json>
///
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub id: String,
    pub event: String,
    pub data: String,
}

impl SseFrame {
    /// Build a frame whose `data` line is the JSON encoding of `payload`.
    pub fn json(
        id: impl Into<String>,
        event: impl Into<String>,
        payload: &impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.into(),
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }

    /// Minimal frame used when the real payload could not be serialized.
    pub fn fallback(id: impl Into<String>, event: impl Into<String>, reason: &str) -> Self {
        let data = serde_json::json!({
            "error": "serialization_failed",
            "message": reason,
        })
        .to_string();
        Self {
            id: id.into(),
            event: event.into(),
            data,
        }
    }

    /// `challenge_completed` (or future kind) frame for a published event.
    pub fn event(event: &Event) -> Result<Self, serde_json::Error> {
        use trophy_core::types::EventPayload;

        match &event.payload {
            EventPayload::ChallengeCompleted(completion) => {
                Self::json(event.id.as_str(), EVENT_CHALLENGE_COMPLETED, completion)
            }
        }
    }

    pub fn connected(payload: &ConnectedPayload) -> Result<Self, serde_json::Error> {
        Self::json(payload.connection_id.clone(), EVENT_CONNECTED, payload)
    }

    pub fn heartbeat(payload: &HeartbeatPayload) -> Result<Self, serde_json::Error> {
        Self::json(heartbeat_id(payload.timestamp), EVENT_HEARTBEAT, payload)
    }

    pub fn empty_state(payload: &EmptyStatePayload) -> Result<Self, serde_json::Error> {
        Self::json(empty_state_id(payload.timestamp), EVENT_EMPTY_STATE, payload)
    }

    /// Serialize to the text wire format.
    ///
    /// Line breaks inside `id` or `event` would start a new field, so they are
    /// replaced with spaces. `data` is compact JSON and never contains one.
    pub fn encode(&self) -> Bytes {
        let mut out = String::with_capacity(self.id.len() + self.event.len() + self.data.len() + 24);
        out.push_str("id: ");
        out.push_str(&single_line(&self.id));
        out.push_str("\nevent: ");
        out.push_str(&single_line(&self.event));
        for line in self.data.split('\n') {
            out.push_str("\ndata: ");
            out.push_str(line);
        }
        out.push_str("\n\n");
        Bytes::from(out)
    }

    /// Deserialize the `data` line.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// Parse every complete message in an event-stream text buffer.
///
/// Comment lines (leading `:`) and unknown fields are ignored; a trailing
/// message without its blank-line terminator is not returned.
pub fn parse_stream(text: &str) -> Vec<SseFrame> {
    let normalized = text.replace("\r\n", "\n");
    let mut frames = Vec::new();
    let mut blocks: Vec<&str> = normalized.split("\n\n").collect();
    // the last segment is either empty or an unterminated message
    blocks.pop();

    for block in blocks {
        let mut id = String::new();
        let mut event = String::new();
        let mut data: Vec<&str> = Vec::new();
        for line in block.lines() {
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "id" => id = value.to_string(),
                "event" => event = value.to_string(),
                "data" => data.push(value),
                _ => {}
            }
        }
        if id.is_empty() && event.is_empty() && data.is_empty() {
            continue;
        }
        frames.push(SseFrame {
            id,
            event,
            data: data.join("\n"),
        });
    }
    frames
}
