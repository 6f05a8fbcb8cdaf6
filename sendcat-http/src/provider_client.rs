//! Real upstream transport for `sendcat_core::ProviderRouter`. Each route
//! id maps to an env-configured base URL; the router already owns
//! retries, timeouts, and failover, so this stays a thin HTTP call.

use async_trait::async_trait;
use sendcat_core::{ProviderCallError, ProviderClient, ProviderResponse};

pub struct HttpProviderClient {
    http: reqwest::Client,
}

impl HttpProviderClient {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    fn base_url(route_id: &str) -> String {
        let env_name = format!("CHAT_PROVIDER_{}_URL", route_id.to_ascii_uppercase());
        std::env::var(&env_name).unwrap_or_else(|_| "http://localhost:11434".to_string())
    }
}

impl Default for HttpProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn send(&self, route_id: &str, model: &str, request: serde_json::Value) -> Result<ProviderResponse, ProviderCallError> {
        let url = Self::base_url(route_id);
        let body = serde_json::json!({ "model": model, "input": request });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderCallError { status: 503, message: e.to_string() })?;

        let status = response.status().as_u16();
        let body = response.json::<serde_json::Value>().await.unwrap_or(serde_json::Value::Null);
        Ok(ProviderResponse { status, body, ..Default::default() })
    }
}
