//! Best-effort delivery of alert envelopes to an external error-collection
//! endpoint (§4.B, §4.G: rate-limit and queue-health alerts are "shipped" as
//! a Sentry-style envelope, never allowed to block or fail the caller).
//!
//! The envelope wire format is three newline-separated JSON documents:
//! an envelope header, an item header naming the item type, and the event
//! payload itself, sent with `Content-Type: application/x-sentry-envelope`.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

/// Anything that can accept a pre-built envelope body. Kept minimal so
/// callers never need to know about HTTP, DSNs, or retries — shipping is
/// always best-effort and its failures are swallowed by the caller.
#[async_trait]
pub trait AlertShipper: Send + Sync + 'static {
    async fn ship(&self, envelope_body: String) -> Result<(), String>;
}

/// Builds the three-line envelope body for `event`.
///
/// `event` must already be a fully-formed Sentry-style event payload (with
/// `message`, `level`, `extra`, etc.) — this function only wraps it.
pub fn build_envelope(event_id: Uuid, timestamp: chrono::DateTime<chrono::Utc>, event: &serde_json::Value) -> String {
    #[derive(Serialize)]
    struct EnvelopeHeader {
        event_id: String,
        sent_at: String,
    }
    #[derive(Serialize)]
    struct ItemHeader {
        #[serde(rename = "type")]
        item_type: &'static str,
    }

    let header = EnvelopeHeader { event_id: event_id.to_string(), sent_at: timestamp.to_rfc3339() };
    let item_header = ItemHeader { item_type: "event" };

    format!(
        "{}\n{}\n{}",
        serde_json::to_string(&header).unwrap_or_default(),
        serde_json::to_string(&item_header).unwrap_or_default(),
        serde_json::to_string(event).unwrap_or_default(),
    )
}

/// Default shipper for tests and for environments with no collector
/// configured: records the envelope in memory and never fails.
#[derive(Default)]
pub struct NullShipper {
    sent: std::sync::Mutex<Vec<String>>,
}

impl NullShipper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertShipper for NullShipper {
    async fn ship(&self, envelope_body: String) -> Result<(), String> {
        self.sent.lock().unwrap().push(envelope_body);
        Ok(())
    }
}

/// Ships envelopes over HTTP to a configured collector endpoint (a Sentry
/// envelope endpoint or compatible ingestion URL).
#[cfg(feature = "sentry-shipping")]
pub struct HttpShipper {
    client: reqwest::Client,
    endpoint: String,
}

#[cfg(feature = "sentry-shipping")]
impl HttpShipper {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), endpoint: endpoint.into() }
    }
}

#[cfg(feature = "sentry-shipping")]
#[async_trait]
impl AlertShipper for HttpShipper {
    async fn ship(&self, envelope_body: String) -> Result<(), String> {
        self.client
            .post(&self.endpoint)
            .header("Content-Type", "application/x-sentry-envelope")
            .body(envelope_body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Ship `event` best-effort: build the envelope and hand it to `shipper`,
/// swallowing any failure. Callers never see a shipping error.
pub async fn ship_best_effort(
    shipper: &dyn AlertShipper,
    event_id: Uuid,
    timestamp: chrono::DateTime<chrono::Utc>,
    event: &serde_json::Value,
) {
    let body = build_envelope(event_id, timestamp, event);
    if let Err(err) = shipper.ship(body).await {
        tracing::warn!(error = %err, "alert envelope shipping failed, dropping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_is_three_json_lines() {
        let body = build_envelope(Uuid::nil(), chrono::Utc::now(), &serde_json::json!({"message": "hi"}));
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        let item_header: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(item_header["type"], "event");
    }

    #[tokio::test]
    async fn ship_best_effort_never_panics_on_failure() {
        struct AlwaysFails;
        #[async_trait]
        impl AlertShipper for AlwaysFails {
            async fn ship(&self, _envelope_body: String) -> Result<(), String> {
                Err("collector unreachable".to_string())
            }
        }
        ship_best_effort(&AlwaysFails, Uuid::nil(), chrono::Utc::now(), &serde_json::json!({})).await;
    }

    #[tokio::test]
    async fn null_shipper_records_sent_envelopes() {
        let shipper = NullShipper::new();
        ship_best_effort(&shipper, Uuid::nil(), chrono::Utc::now(), &serde_json::json!({"a": 1})).await;
        assert_eq!(shipper.sent().len(), 1);
    }
}
