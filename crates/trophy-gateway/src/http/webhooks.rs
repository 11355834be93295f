//! Webhook ingress endpoint — POST /webhooks/{source}.
//!
//! The upstream game backend reports finished challenges here. Each source is
//! authenticated independently according to its `auth_mode` setting in
//! `TrophyConfig::webhooks`; the body becomes one published event.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use trophy_broker::BrokerError;
use trophy_core::config::WebhookAuthMode;
use trophy_core::types::{ChallengeCompletion, Event, EventId, EventPayload};

use crate::app::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Inbound completion as posted by a producer.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletionHook {
    /// Producer-assigned id; lets retries be rejected as duplicates.
    id: Option<String>,
    player_id: String,
    player_name: String,
    challenge_id: String,
    challenge_name: String,
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    points: Option<i64>,
}

impl CompletionHook {
    fn into_event(self, now: DateTime<Utc>) -> Event {
        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .map(EventId::from)
            .unwrap_or_default();
        let completion = ChallengeCompletion {
            player_id: self.player_id,
            player_name: self.player_name,
            challenge_id: self.challenge_id,
            challenge_name: self.challenge_name,
            completed_at: self.completed_at.unwrap_or(now),
            points: self.points,
        };
        Event::with_id(id, EventPayload::ChallengeCompleted(completion), now)
    }
}

// ── Public handler ────────────────────────────────────────────────────────────

/// POST /webhooks/{source}
///
/// Verifies the request signature/token and publishes the completion.
/// Returns 200 + broadcast report on success, 401 on auth failure, 400 on a
/// malformed body, 409 when the event id is still retained.
pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let cfg = &state.config.webhooks;

    if !cfg.enabled {
        warn!(source = %source, "webhook received but ingress is disabled");
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "webhook ingress is disabled"})),
        ));
    }

    let source_cfg = cfg
        .sources
        .iter()
        .find(|s| s.name == source)
        .ok_or_else(|| {
            warn!(source = %source, "unknown webhook source");
            (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "unknown webhook source"})),
            )
        })?;

    info!(source = %source, bytes = body.len(), "webhook arrived");

    authenticate(
        &source_cfg.auth_mode,
        source_cfg.secret.as_deref(),
        &headers,
        &body,
    )
    .map_err(|e| {
        warn!(source = %source, reason = %e, "webhook authentication failed");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "authentication failed", "reason": e.to_string()})),
        )
    })?;

    let hook: CompletionHook = serde_json::from_slice(&body).map_err(|e| {
        warn!(source = %source, error = %e, "invalid completion body");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid completion body", "reason": e.to_string()})),
        )
    })?;

    let event = hook.into_event(Utc::now());
    let event_id = event.id.clone();
    let report = state.hub.publish(event).map_err(|e| match e {
        BrokerError::DuplicateEvent { .. } => (
            StatusCode::CONFLICT,
            Json(json!({"error": e.to_string(), "code": e.code()})),
        ),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": other.to_string(), "code": other.code()})),
        ),
    })?;

    info!(source = %source, event_id = %event_id, "webhook accepted");
    Ok(Json(json!({
        "ok": true,
        "eventId": event_id.as_str(),
        "delivered": report.delivered,
        "failed": report.failed,
    })))
}

// ── Authentication ────────────────────────────────────────────────────────────

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Why a request was refused. The message is returned to the caller, so it
/// never includes the secret or the presented credential.
#[derive(Debug, Error, PartialEq, Eq)]
enum AuthFailure {
    #[error("no secret configured for this source")]
    NoSecret,
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("malformed {0} header")]
    MalformedHeader(&'static str),
    #[error("credential mismatch")]
    Mismatch,
}

fn authenticate(
    mode: &WebhookAuthMode,
    secret: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AuthFailure> {
    match mode {
        WebhookAuthMode::None => Ok(()),
        WebhookAuthMode::HmacSha256 => {
            verify_signature(headers, body, secret.ok_or(AuthFailure::NoSecret)?)
        }
        WebhookAuthMode::BearerToken => {
            verify_bearer(headers, secret.ok_or(AuthFailure::NoSecret)?)
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, AuthFailure> {
    headers
        .get(name)
        .ok_or(AuthFailure::MissingHeader(name))?
        .to_str()
        .map_err(|_| AuthFailure::MalformedHeader(name))
}

fn keyed_mac(secret: &str) -> Result<HmacSha256, AuthFailure> {
    // HMAC accepts keys of any length; this never fails in practice
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthFailure::NoSecret)
}

/// `X-Hub-Signature-256: sha256=<hex>` over the raw body.
fn verify_signature(headers: &HeaderMap, body: &[u8], secret: &str) -> Result<(), AuthFailure> {
    let presented = header(headers, SIGNATURE_HEADER)?
        .strip_prefix("sha256=")
        .and_then(|hex_sig| hex::decode(hex_sig).ok())
        .ok_or(AuthFailure::MalformedHeader(SIGNATURE_HEADER))?;

    let mut mac = keyed_mac(secret)?;
    mac.update(body);
    mac.verify_slice(&presented).map_err(|_| AuthFailure::Mismatch)
}

/// `Authorization: Bearer <token>`. Both tokens are run through HMAC so the
/// final comparison is constant-time.
fn verify_bearer(headers: &HeaderMap, secret: &str) -> Result<(), AuthFailure> {
    let token = header(headers, "authorization")?
        .strip_prefix("Bearer ")
        .ok_or(AuthFailure::MalformedHeader("authorization"))?;

    let mut expected = keyed_mac(secret)?;
    expected.update(secret.as_bytes());
    let expected = expected.finalize().into_bytes();

    let mut presented = keyed_mac(secret)?;
    presented.update(token.as_bytes());
    presented.verify_slice(&expected).map_err(|_| AuthFailure::Mismatch)
}
