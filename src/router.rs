//! Component H: provider router.
//!
//! Picks a model class from the requested model id, builds an ordered list
//! of candidate routes, and drives each one through its bulkhead, circuit
//! breaker, and timeout before falling over to the next candidate. Retries
//! within a route use a linear backoff (`100 + attempt * 150ms`); failover
//! across routes is reserved for upstream errors where trying a different
//! provider is actually likely to help (timeouts, quota, rate limits, auth)
//! — a bad request or a client-side validation error is not, so those
//! propagate immediately without burning through every route.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::config::{ChatRouteConfig, CircuitBreakerConfigEntry, CircuitBreakers};
use crate::telemetry::{PolicyEvent, RouterEvent};
use crate::timeout::TimeoutPolicy;

/// Coarse model tiers the gateway routes between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelClass {
    Fast,
    Agent,
}

/// Infer the model class from substrings in the requested model id, the
/// same heuristic the teacher's config layer uses for env-driven
/// allow-lists: small, fast chat models carry one of these markers in
/// their id; anything else is treated as a full agent-capable model.
pub fn infer_model_class(model_id: &str) -> ModelClass {
    let lower = model_id.to_ascii_lowercase();
    const FAST_MARKERS: [&str; 4] = ["mini", "flash", "haiku", "kimi"];
    if FAST_MARKERS.iter().any(|marker| lower.contains(marker)) {
        ModelClass::Fast
    } else {
        ModelClass::Agent
    }
}

/// Why an upstream call failed, independent of transport details.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamErrorCode {
    Timeout,
    RateLimited,
    QuotaExceeded,
    Unavailable,
    BadRequest,
    Auth,
    Error,
}

impl UpstreamErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamErrorCode::Timeout => "upstream_timeout",
            UpstreamErrorCode::RateLimited => "upstream_rate_limited",
            UpstreamErrorCode::QuotaExceeded => "upstream_quota_exceeded",
            UpstreamErrorCode::Unavailable => "upstream_unavailable",
            UpstreamErrorCode::BadRequest => "upstream_bad_request",
            UpstreamErrorCode::Auth => "upstream_auth",
            UpstreamErrorCode::Error => "upstream_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            UpstreamErrorCode::Timeout => 504,
            UpstreamErrorCode::RateLimited => 429,
            UpstreamErrorCode::QuotaExceeded => 402,
            UpstreamErrorCode::Unavailable => 503,
            UpstreamErrorCode::BadRequest => 400,
            UpstreamErrorCode::Auth => 401,
            UpstreamErrorCode::Error => 502,
        }
    }

    /// Worth retrying the *same* route.
    fn retryable(&self) -> bool {
        matches!(self, UpstreamErrorCode::Timeout | UpstreamErrorCode::Unavailable | UpstreamErrorCode::RateLimited)
    }

    /// Worth trying a *different* route.
    fn triggers_failover(&self) -> bool {
        matches!(
            self,
            UpstreamErrorCode::Timeout | UpstreamErrorCode::Unavailable | UpstreamErrorCode::QuotaExceeded | UpstreamErrorCode::Auth | UpstreamErrorCode::RateLimited
        )
    }

    /// Classify a raw upstream HTTP status into an `UpstreamErrorCode`.
    /// Assumes the caller has already filtered out 2xx/3xx successes.
    pub fn from_status(status: u16) -> Self {
        match status {
            402 => UpstreamErrorCode::QuotaExceeded,
            429 => UpstreamErrorCode::RateLimited,
            401 | 403 => UpstreamErrorCode::Auth,
            400 | 422 => UpstreamErrorCode::BadRequest,
            408 | 504 => UpstreamErrorCode::Timeout,
            500..=599 => UpstreamErrorCode::Unavailable,
            _ => UpstreamErrorCode::Error,
        }
    }
}

/// Error shape safe to hand back to the HTTP layer: no internal route
/// topology, no provider credentials, no stack traces.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientSafeError {
    pub code: &'static str,
    pub message: String,
    pub retry_after_ms: Option<u64>,
    pub retryable: bool,
    pub provider_id: String,
    pub route_id: String,
    pub status: u16,
}

#[derive(Default)]
pub struct ProviderResponse {
    pub status: u16,
    pub body: serde_json::Value,
    pub route_id: String,
    pub provider_id: String,
}

#[derive(Clone, Debug)]
pub struct ProviderCallError {
    pub status: u16,
    pub message: String,
}

/// Abstracts the actual upstream transport so the router's retry/failover
/// logic can be tested without a real HTTP client.
#[async_trait]
pub trait ProviderClient: Send + Sync + 'static {
    async fn send(&self, route_id: &str, model: &str, request: serde_json::Value) -> Result<ProviderResponse, ProviderCallError>;
}

struct Route {
    id: &'static str,
    provider: &'static str,
    config: ChatRouteConfig,
}

pub struct ProviderRouter {
    client: Arc<dyn ProviderClient>,
    breakers: CircuitBreakerRegistry,
    breaker_config: CircuitBreakers,
    bulkheads: Arc<dyn Fn(&str) -> Bulkhead + Send + Sync>,
    failover_enabled: bool,
    sink: Arc<dyn Fn(PolicyEvent) + Send + Sync>,
}

impl ProviderRouter {
    pub fn new(
        client: Arc<dyn ProviderClient>,
        breakers: CircuitBreakerRegistry,
        breaker_config: CircuitBreakers,
        bulkheads: Arc<dyn Fn(&str) -> Bulkhead + Send + Sync>,
        failover_enabled: bool,
        sink: Arc<dyn Fn(PolicyEvent) + Send + Sync>,
    ) -> Self {
        Self { client, breakers, breaker_config, bulkheads, failover_enabled, sink }
    }

    /// Candidate routes for this request. The secondary route is only
    /// offered when `FF_PROVIDER_FAILOVER_ENABLED` is on — otherwise a
    /// failure on the primary exhausts the list instead of spilling over.
    fn routes(&self, primary: ChatRouteConfig, secondary: ChatRouteConfig) -> Vec<Route> {
        let mut routes = vec![Route { id: "chat_primary", provider: "chat_primary", config: primary }];
        if self.failover_enabled {
            routes.push(Route { id: "chat_secondary", provider: "chat_secondary", config: secondary });
        }
        routes
    }

    fn breaker_config_for(&self, provider: &str) -> crate::circuit_breaker::CircuitBreakerConfig {
        let entry: CircuitBreakerConfigEntry = match provider {
            "chat_primary" => self.breaker_config.chat_primary,
            "chat_secondary" => self.breaker_config.chat_secondary,
            "search_web" => self.breaker_config.search_web,
            "search_products" => self.breaker_config.search_products,
            "search_global" => self.breaker_config.search_global,
            _ => self.breaker_config.chat_primary,
        };
        crate::circuit_breaker::CircuitBreakerConfig::new(entry.threshold, Duration::from_millis(entry.cooldown_ms))
    }

    /// Honor a literal `model_id` that names one of the four configured
    /// models directly rather than silently overriding it with the
    /// route's class-derived model.
    fn literal_model_override(model_id: &str, primary: &ChatRouteConfig, secondary: &ChatRouteConfig) -> Option<String> {
        [&primary.fast_model, &primary.agent_model, &secondary.fast_model, &secondary.agent_model]
            .iter()
            .any(|configured| configured.as_str() == model_id)
            .then(|| model_id.to_string())
    }

    /// Drive `request` through each candidate route in turn, retrying
    /// within a route on a retryable error and falling over to the next
    /// route when the error is failover-eligible.
    pub async fn route_chat_request(
        &self,
        model_id: &str,
        primary: ChatRouteConfig,
        secondary: ChatRouteConfig,
        request: serde_json::Value,
    ) -> Result<ProviderResponse, ClientSafeError> {
        let model_class = infer_model_class(model_id);
        let literal_model = Self::literal_model_override(model_id, &primary, &secondary);
        let routes = self.routes(primary, secondary);
        let mut last_error: Option<ClientSafeError> = None;

        for (route_index, route) in routes.iter().enumerate() {
            let breaker = self.breakers.get_or_create(route.provider, self.breaker_config_for(route.provider));
            if breaker.check_gate().is_err() {
                continue;
            }

            let bulkhead = (self.bulkheads)(route.provider);
            let guard = match bulkhead.acquire_slot(&|_event| {}) {
                Ok(guard) => guard,
                Err(_) => continue,
            };

            (self.sink)(PolicyEvent::Router(RouterEvent::RouteSelected { route: route.id.to_string(), model_class: model_class_str(model_class).to_string() }));

            let model_for_route = literal_model.clone().unwrap_or_else(|| match model_class {
                ModelClass::Fast => route.config.fast_model.clone(),
                ModelClass::Agent => route.config.agent_model.clone(),
            });

            let outcome = self.drive_route(route, &model_for_route, request.clone(), &breaker).await;
            drop(guard);

            match outcome {
                Ok(response) => {
                    return Ok(ProviderResponse {
                        route_id: route.id.to_string(),
                        provider_id: route.provider.to_string(),
                        ..response
                    });
                }
                Err(err) => {
                    let failover = UpstreamErrorCode::from_status(err.status).triggers_failover();
                    let client_error = to_client_safe_error(route, &err);
                    (self.sink)(PolicyEvent::Router(RouterEvent::UpstreamError { route: route.id.to_string(), code: client_error.code.to_string() }));

                    if failover && route_index + 1 < routes.len() {
                        (self.sink)(PolicyEvent::Router(RouterEvent::Failover {
                            from_route: route.id.to_string(),
                            to_route: routes[route_index + 1].id.to_string(),
                            reason: client_error.code.to_string(),
                        }));
                        last_error = Some(client_error);
                        continue;
                    }
                    return Err(client_error);
                }
            }
        }

        (self.sink)(PolicyEvent::Router(RouterEvent::AllRoutesExhausted { routes_tried: routes.len() }));
        Err(last_error.unwrap_or_else(|| ClientSafeError {
            code: UpstreamErrorCode::Unavailable.as_str(),
            message: "no provider route is currently available".to_string(),
            retry_after_ms: None,
            retryable: true,
            provider_id: "none".to_string(),
            route_id: "none".to_string(),
            status: UpstreamErrorCode::Unavailable.http_status(),
        }))
    }

    async fn drive_route(
        &self,
        route: &Route,
        model: &str,
        request: serde_json::Value,
        breaker: &crate::circuit_breaker::CircuitBreaker,
    ) -> Result<ProviderResponse, ProviderCallError> {
        let timeout = TimeoutPolicy::new(Duration::from_millis(route.config.timeout_ms)).expect("non-zero configured timeout");
        let mut attempt = 0usize;

        loop {
            let client = self.client.clone();
            let route_id = route.id.to_string();
            let model = model.to_string();
            let request = request.clone();

            let call_result = timeout
                .execute(|| async move {
                    client.send(&route_id, &model, request).await.map_err(|e| crate::error::ResilienceError::Inner(RouterCallError(e)))
                })
                .await;

            let outcome = match call_result {
                Ok(response) if (200..400).contains(&response.status) => Ok(response),
                Ok(response) => Err(ProviderCallError { status: response.status, message: "non-success status".to_string() }),
                Err(crate::error::ResilienceError::Timeout { .. }) => Err(ProviderCallError { status: 504, message: "call timed out".to_string() }),
                Err(crate::error::ResilienceError::Inner(RouterCallError(inner))) => Err(inner),
                Err(other) => Err(ProviderCallError { status: 502, message: other.to_string() }),
            };

            match outcome {
                Ok(response) => {
                    breaker.record_success(&|_event| {});
                    return Ok(response);
                }
                Err(err) => {
                    breaker.record_failure(&|_event| {});
                    let code = UpstreamErrorCode::from_status(err.status);
                    if code.retryable() && attempt + 1 < route.config.retries {
                        attempt += 1;
                        let backoff = Duration::from_millis(100 + (attempt as u64) * 150);
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[derive(Debug)]
struct RouterCallError(ProviderCallError);

impl std::fmt::Display for RouterCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "provider call failed with status {}: {}", self.0.status, self.0.message)
    }
}

impl std::error::Error for RouterCallError {}

fn model_class_str(class: ModelClass) -> &'static str {
    match class {
        ModelClass::Fast => "fast",
        ModelClass::Agent => "agent",
    }
}

fn to_client_safe_error(route: &Route, err: &ProviderCallError) -> ClientSafeError {
    let code = UpstreamErrorCode::from_status(err.status);
    ClientSafeError {
        code: code.as_str(),
        message: err.message.clone(),
        retry_after_ms: if code.retryable() { Some(1_000) } else { None },
        retryable: code.retryable(),
        provider_id: route.provider.to_string(),
        route_id: route.id.to_string(),
        status: code.http_status(),
    }
}
