//! Webhook ingestion collaborators (§4.I, §6): Gmail push notifications and
//! WhatsApp inbound messages. Both share the same guard shape as the chat
//! endpoint — content-type, size, then a replay-dedup/rate-limit pair —
//! but are thinner: no admission, no provider routing, just "accept once
//! and enqueue" semantics represented here as a bare acknowledgement.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::state::AppState;

const MAX_BODY_BYTES: usize = 65_536;
const REPLAY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

fn check_content_type(headers: &HeaderMap) -> Result<(), ApiError> {
    let content_type = headers.get(axum::http::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or("");
    if !content_type.starts_with("application/json") {
        return Err(ApiError::UnsupportedMediaType);
    }
    Ok(())
}

fn check_body_size(body: &Bytes) -> Result<(), ApiError> {
    if body.len() > MAX_BODY_BYTES {
        return Err(ApiError::PayloadTooLarge);
    }
    Ok(())
}

async fn ingest(state: &AppState, scope: &str, dedupe_key: &str, envelope: &Value) -> Result<(), ApiError> {
    let now = Utc::now();
    let rate_outcome = state
        .rate_limiter
        .check_and_increment("webhook_ingest", scope, &state.config.rate_limits.webhook_ingest, now)
        .await;
    if !rate_outcome.allowed {
        return Err(ApiError::RateLimited { retry_after_ms: rate_outcome.retry_after_ms });
    }

    let replay = state.replay.claim_key(scope, dedupe_key, REPLAY_TTL, now).await;
    if replay.duplicate {
        tracing::debug!(scope, dedupe_key, "duplicate webhook delivery, acknowledging without re-processing");
    }
    let _ = envelope;
    Ok(())
}

pub async fn gmail_push(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Response, ApiError> {
    check_content_type(&headers)?;
    check_body_size(&body)?;
    let envelope: Value = serde_json::from_slice(&body).map_err(|e| ApiError::InvalidJson(e.to_string()))?;
    let message_id = envelope
        .get("message")
        .and_then(|m| m.get("messageId"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::InvalidRequest(vec!["message.messageId is required".to_string()]))?;

    ingest(&state, "gmail_push", message_id, &envelope).await?;
    Ok(StatusCode::OK.into_response())
}

#[derive(Deserialize)]
pub struct WhatsappVerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
}

/// Meta's webhook subscription handshake: echo back `hub.challenge` once
/// the verify token matches the operator-configured secret.
pub async fn whatsapp_verify(Query(query): Query<WhatsappVerifyQuery>) -> Result<Response, ApiError> {
    let expected = std::env::var("WHATSAPP_WEBHOOK_VERIFY_TOKEN").unwrap_or_default();
    match (query.mode.as_deref(), query.verify_token, query.challenge) {
        (Some("subscribe"), Some(token), Some(challenge)) if !expected.is_empty() && token == expected => {
            Ok(challenge.into_response())
        }
        _ => Err(ApiError::Forbidden),
    }
}

pub async fn whatsapp_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Result<Response, ApiError> {
    check_content_type(&headers)?;
    check_body_size(&body)?;
    let envelope: Value = serde_json::from_slice(&body).map_err(|e| ApiError::InvalidJson(e.to_string()))?;
    let entry_id = envelope
        .get("entry")
        .and_then(|e| e.as_array())
        .and_then(|arr| arr.first())
        .and_then(|first| first.get("id"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");

    ingest(&state, "whatsapp_webhook", entry_id, &envelope).await?;
    Ok(StatusCode::OK.into_response())
}
