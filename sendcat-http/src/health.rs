//! `GET /api/chat/health` (§4.I): origin-guarded readiness probe that
//! returns the redacted configuration snapshot. Never returns secrets.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
struct HealthBody {
    ready: bool,
    config: sendcat_core::RedactedConfig,
}

pub async fn handle(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    if let Some(origin) = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) {
        if !state.config.allowed_origins.is_empty() && !state.config.allowed_origins.contains(origin) {
            return Err(ApiError::Forbidden);
        }
    }
    let ready = state.config.flags.chat_gateway_enabled && state.config.flags.chat_gateway_health_enabled;
    Ok(Json(HealthBody { ready, config: state.config.redacted() }).into_response())
}
