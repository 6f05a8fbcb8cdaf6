//! The HTTP error taxonomy (§7): every non-2xx response carries
//! `x-sendcat-error-code` and a `{code, message, ...}` JSON body.

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

fn error_code_header() -> HeaderName {
    HeaderName::from_static("x-sendcat-error-code")
}

#[derive(Debug, Clone)]
pub enum ApiError {
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    InvalidJson(String),
    InvalidRequest(Vec<String>),
    UnsupportedMediaType,
    PayloadTooLarge,
    RateLimited { retry_after_ms: u64 },
    Upstream { code: &'static str, status: u16, message: String, retry_after_ms: Option<u64> },
    Misconfigured(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    issues: Option<Vec<String>>,
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::InvalidJson(_) => "invalid_json",
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnsupportedMediaType => "unsupported_media_type",
            Self::PayloadTooLarge => "payload_too_large",
            Self::RateLimited { .. } => "rate_limited",
            Self::Upstream { code, .. } => code,
            Self::Misconfigured(_) => "misconfigured",
            Self::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::InvalidJson(_) | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream { status, .. } => StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
            Self::Misconfigured(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Unauthorized => "missing or invalid bearer token".to_string(),
            Self::Forbidden => "origin not allowed".to_string(),
            Self::NotFound => "not found".to_string(),
            Self::MethodNotAllowed => "method not allowed".to_string(),
            Self::InvalidJson(msg) => msg.clone(),
            Self::InvalidRequest(_) => "request failed schema validation".to_string(),
            Self::UnsupportedMediaType => "content-type must be application/json".to_string(),
            Self::PayloadTooLarge => "request body exceeds the size cap".to_string(),
            Self::RateLimited { .. } => "rate limit exceeded".to_string(),
            Self::Upstream { message, .. } => message.clone(),
            Self::Misconfigured(msg) => msg.clone(),
            Self::Internal(msg) => msg.clone(),
        }
    }

    fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            Self::Upstream { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let issues = match &self {
            Self::InvalidRequest(issues) => Some(issues.clone()),
            _ => None,
        };
        let retry_after_ms = self.retry_after_ms();
        let body = ErrorBody { code, message: self.message(), issues };

        let mut response = (status, axum::Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(code) {
            response.headers_mut().insert(error_code_header(), value);
        }
        if let Some(ms) = retry_after_ms {
            if let Ok(value) = HeaderValue::from_str(&ms.to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Map a `ClientSafeError` from the provider router onto the HTTP error
/// taxonomy (§4.I "Route acquisition").
impl From<sendcat_core::ClientSafeError> for ApiError {
    fn from(e: sendcat_core::ClientSafeError) -> Self {
        ApiError::Upstream {
            code: e.code,
            status: e.status,
            message: e.message,
            retry_after_ms: e.retry_after_ms,
        }
    }
}
