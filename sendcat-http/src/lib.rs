//! Chat gateway HTTP surface (§4.I, §6): the guarded streaming endpoint,
//! its health sibling, and the webhook/OAuth collaborators that feed the
//! tool-job queue.

mod chat;
mod error;
mod health;
mod oauth;
mod provider_client;
mod state;
mod webhooks;

pub use error::ApiError;
pub use provider_client::HttpProviderClient;
pub use state::AppState;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat::handle).options(chat::preflight))
        .route("/api/chat/health", get(health::handle))
        .route("/api/gmail/push", post(webhooks::gmail_push))
        .route("/api/gmail/auth/callback", get(oauth::callback))
        .route("/api/whatsapp/webhook", get(webhooks::whatsapp_verify).post(webhooks::whatsapp_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
