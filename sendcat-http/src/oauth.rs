//! `GET /api/gmail/auth/callback` (§6): OAuth exchange redirect.
//!
//! The gateway does not own the OAuth token exchange itself — that lives
//! with the mail collaborator — but terminates the redirect: it validates
//! the query shape and bounces the browser onward, appending `error` to
//! the query string on anything malformed or oversized rather than
//! rendering an error page here.

use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::state::AppState;

const MAX_QUERY_PARAM_BYTES: usize = 2_048;

#[derive(Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

fn redirect_to(location: &str) -> Response {
    let mut response = StatusCode::FOUND.into_response();
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(axum::http::header::LOCATION, value);
    }
    response
}

pub async fn callback(State(state): State<AppState>, Query(query): Query<CallbackQuery>) -> Response {
    let base = state
        .config
        .allowed_origins
        .iter()
        .next()
        .cloned()
        .unwrap_or_else(|| "/".to_string());

    let oversized = [&query.code, &query.state, &query.error]
        .into_iter()
        .any(|field| field.as_deref().map(|v| v.len() > MAX_QUERY_PARAM_BYTES).unwrap_or(false));

    if oversized || query.error.is_some() {
        return redirect_to(&format!("{base}/gmail/connected?error=invalid_oauth_callback"));
    }

    match (query.code, query.state) {
        (Some(code), Some(oauth_state)) => {
            redirect_to(&format!("{base}/gmail/connected?code={code}&state={oauth_state}"))
        }
        _ => redirect_to(&format!("{base}/gmail/connected?error=missing_params")),
    }
}
