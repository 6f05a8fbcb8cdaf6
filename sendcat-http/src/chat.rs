//! `POST|OPTIONS /api/chat`: the guarded streaming endpoint (§4.I).
//!
//! Guards run in a fixed order so a request fails on the cheapest check
//! first: method, CORS preflight, origin, content-type, body size, auth,
//! JSON parse/schema, HTTP rate limit, admission, then route acquisition.
//! Every exit path — including the streaming tail — releases the admission
//! ticket exactly once.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::stream::{self, Stream};
use serde::Deserialize;

use sendcat_core::{infer_model_class, AdmissionDenyReason, ModelClass, WaitOutcome};

use crate::error::ApiError;
use crate::state::AppState;

const MAX_BODY_BYTES: usize = 65_536;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    thread_id: String,
    content: String,
    model_id: String,
    #[serde(default)]
    web_search: bool,
}

fn cors_headers(origin: &str) -> [(axum::http::HeaderName, HeaderValue); 3] {
    [
        (axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_str(origin).unwrap_or(HeaderValue::from_static("null"))),
        (axum::http::header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("POST, OPTIONS")),
        (axum::http::header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("authorization, content-type")),
    ]
}

/// `OPTIONS /api/chat`: always 204; CORS headers are attached only when the
/// caller's `Origin` is on the allow-list, matching a real preflight's
/// silent non-disclosure of the allow-list to unrecognized origins.
pub async fn preflight(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let origin = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok());
    let mut response = StatusCode::NO_CONTENT.into_response();
    if let Some(origin) = origin {
        if state.config.allowed_origins.contains(origin) {
            for (name, value) in cors_headers(origin) {
                response.headers_mut().insert(name, value);
            }
        }
    }
    response
}

fn check_origin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if let Some(origin) = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) {
        if !state.config.allowed_origins.is_empty() && !state.config.allowed_origins.contains(origin) {
            return Err(ApiError::Forbidden);
        }
    }
    Ok(())
}

fn check_content_type(headers: &HeaderMap) -> Result<(), ApiError> {
    let content_type = headers.get(axum::http::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or("");
    if !content_type.starts_with("application/json") {
        return Err(ApiError::UnsupportedMediaType);
    }
    Ok(())
}

fn check_body_size(headers: &HeaderMap, body: &Bytes) -> Result<(), ApiError> {
    let declared = headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(body.len());
    if declared > MAX_BODY_BYTES || body.len() > MAX_BODY_BYTES {
        return Err(ApiError::PayloadTooLarge);
    }
    Ok(())
}

/// Bearer token check against the operator-configured shared secret. The
/// gateway authenticates the caller (another internal service or an
/// authenticated edge), not end users directly — there is no session
/// store here.
fn check_auth<'a>(headers: &'a HeaderMap) -> Result<&'a str, ApiError> {
    let expected = std::env::var("CHAT_GATEWAY_BEARER_TOKEN").unwrap_or_default();
    let header = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()).ok_or(ApiError::Unauthorized)?;
    let token = header.strip_prefix("Bearer ").ok_or(ApiError::Unauthorized)?;
    if expected.is_empty() || token != expected {
        return Err(ApiError::Unauthorized);
    }
    Ok(token)
}

fn user_id(headers: &HeaderMap) -> String {
    headers.get("x-user-id").and_then(|v| v.to_str().ok()).unwrap_or("anonymous").to_string()
}

fn session_id(headers: &HeaderMap) -> String {
    headers.get("x-session-id").and_then(|v| v.to_str().ok()).unwrap_or("anonymous").to_string()
}

pub async fn handle(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if method != Method::POST {
        return Err(ApiError::MethodNotAllowed);
    }
    check_origin(&state, &headers)?;
    check_content_type(&headers)?;
    check_body_size(&headers, &body)?;
    check_auth(&headers)?;

    let request: ChatRequest = serde_json::from_slice(&body).map_err(|e| ApiError::InvalidJson(e.to_string()))?;
    let mut issues = Vec::new();
    if request.thread_id.trim().is_empty() {
        issues.push("threadId must not be empty".to_string());
    }
    if request.content.trim().is_empty() {
        issues.push("content must not be empty".to_string());
    }
    if request.model_id.trim().is_empty() {
        issues.push("modelId must not be empty".to_string());
    }
    if !issues.is_empty() {
        return Err(ApiError::InvalidRequest(issues));
    }

    let now = Utc::now();
    let session = session_id(&headers);
    let user = user_id(&headers);

    let rate_outcome = state
        .rate_limiter
        .check_and_increment(
            "chat_stream",
            &format!("session:{session}"),
            &state.config.rate_limits.chat_stream_session,
            now,
        )
        .await;
    if !rate_outcome.allowed {
        return Err(ApiError::RateLimited { retry_after_ms: rate_outcome.retry_after_ms });
    }

    let mode = state.config.admission_mode();
    let admission = state
        .admission
        .check_and_acquire_admission(&format!("user:{user}"), 1, &state.config.admission, mode, now)
        .await;
    if !admission.granted {
        let bypass_redis_outage = admission.deny_reason == Some(AdmissionDenyReason::RedisUnavailable)
            && !state.config.flags.fail_closed_on_redis_error;
        if !bypass_redis_outage {
            return Err(ApiError::RateLimited { retry_after_ms: admission.retry_after_ms.unwrap_or(1_000) });
        }
        tracing::warn!(user, "admission backend unavailable, proceeding in legacy-limiter-only mode");
    }
    let ticket_id = admission.ticket_id;

    let tool_events = if request.web_search {
        run_web_search_tool(&state, &request).await
    } else {
        Vec::new()
    };

    let route_result = state
        .router
        .route_chat_request(
            &request.model_id,
            state.config.chat_primary.clone(),
            state.config.chat_secondary.clone(),
            serde_json::json!({
                "threadId": request.thread_id,
                "content": request.content,
                "modelId": request.model_id,
                "webSearch": request.web_search,
            }),
        )
        .await;

    if let Some(ticket_id) = ticket_id {
        state.admission.release_admission(ticket_id).await;
    }

    let response = route_result?;
    Ok(Sse::new(stream_response(request.model_id, response, tool_events)))
}

/// Enqueues a `search_web` tool job behind component G and waits on it
/// inline, translating the outcome into the streaming taxonomy's
/// tool-related events. The gateway queues and reports on tool jobs; it
/// does not execute them — a worker elsewhere claims and completes them.
async fn run_web_search_tool(state: &AppState, request: &ChatRequest) -> Vec<Event> {
    let mut events = vec![Event::default()
        .event("tool-call-started")
        .data(serde_json::json!({ "tool": "search_web" }).to_string())];

    let outcome = state
        .queue
        .enqueue_tool_job_and_wait("search_web", serde_json::json!({ "query": request.content }), |_job_id| None)
        .await;

    match outcome {
        WaitOutcome::Completed(output) => {
            events.push(
                Event::default()
                    .event("tool-output-partially-available")
                    .data(serde_json::json!({ "tool": "search_web", "output": output }).to_string()),
            );
        }
        WaitOutcome::Saturated => {
            events.push(
                Event::default().event("tool-backpressure").data(
                    serde_json::json!({ "reason": "queue_saturated", "retryable": true, "retryAfterMs": 1_000 }).to_string(),
                ),
            );
        }
        WaitOutcome::Timeout => {
            events.push(
                Event::default()
                    .event("tool-backpressure")
                    .data(serde_json::json!({ "reason": "timeout", "retryable": true, "retryAfterMs": 1_000 }).to_string()),
            );
        }
        WaitOutcome::DeadLettered(reason) => {
            events.push(Event::default().event("error").data(
                serde_json::json!({ "code": "tool_failed", "message": reason.unwrap_or_else(|| "search_web failed".to_string()) })
                    .to_string(),
            ));
        }
    }

    events
}

fn stream_response(
    model_id: String,
    response: sendcat_core::ProviderResponse,
    tool_events: Vec<Event>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let model_class = match infer_model_class(&model_id) {
        ModelClass::Fast => "fast",
        ModelClass::Agent => "agent",
    };

    let text = response
        .body
        .get("content")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| response.body.to_string());

    let mut events = vec![Event::default().event("provider-route").data(
        serde_json::json!({ "modelClass": model_class, "providerId": response.provider_id, "routeId": response.route_id })
            .to_string(),
    )];
    events.extend(tool_events);

    const CHUNK: usize = 80;
    let chars: Vec<char> = text.chars().collect();
    for piece in chars.chunks(CHUNK) {
        let token: String = piece.iter().collect();
        events.push(Event::default().event("token").data(serde_json::json!({ "token": token }).to_string()));
    }
    events.push(Event::default().event("done").data("{}"));

    stream::iter(events.into_iter().map(Ok))
}
