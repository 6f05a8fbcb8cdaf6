//! Binds the chat gateway HTTP surface and serves it.

use std::sync::Arc;
use std::time::Duration;

use sendcat_core::{
    AdmissionBackend, AdmissionControl, Bulkhead, BulkheadConfigEntry, CircuitBreakerRegistry, Config,
    InMemoryAdmissionBackend, ProviderRouter, RateLimiter, ReplayGuard, ToolQueue,
};
use sendcat_http::{AppState, HttpProviderClient};

fn listen_addr() -> String {
    std::env::var("CHAT_GATEWAY_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
}

/// Connects to the configured Redis admission backend, falling back to the
/// in-process fake only when no `ADMISSION_REDIS_URL` is set — the same
/// posture single-instance deployments without Redis get in tests.
#[cfg(feature = "redis-backend")]
async fn build_admission_backend(config: &Config) -> anyhow::Result<Arc<dyn AdmissionBackend>> {
    if config.admission.redis_url.is_empty() {
        tracing::warn!("ADMISSION_REDIS_URL unset; admission counters are in-process only");
        return Ok(Arc::new(InMemoryAdmissionBackend::default()));
    }
    let backend = sendcat_core::RedisAdmissionBackend::connect(&config.admission.redis_url).await?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "redis-backend"))]
async fn build_admission_backend(_config: &Config) -> anyhow::Result<Arc<dyn AdmissionBackend>> {
    Ok(Arc::new(InMemoryAdmissionBackend::default()))
}

fn bulkhead_for(provider: &str, entry: BulkheadConfigEntry) -> Bulkhead {
    Bulkhead::new(provider.to_string(), entry.max_concurrent, Duration::from_millis(entry.lease_ttl_ms))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Arc::new(Config::snapshot());
    let rate_limiter = Arc::new(RateLimiter::in_memory());
    let admission_backend = build_admission_backend(&config).await?;
    let admission = Arc::new(AdmissionControl::new(admission_backend, Arc::new(|_event| {})));
    let replay = Arc::new(ReplayGuard::in_memory());

    let client = Arc::new(HttpProviderClient::new());
    let breakers = CircuitBreakerRegistry::new();
    let bulkhead_config = config.bulkheads.clone();
    let bulkheads = Arc::new(move |provider: &str| match provider {
        "chat_primary" => bulkhead_for(provider, bulkhead_config.chat_primary),
        "chat_secondary" => bulkhead_for(provider, bulkhead_config.chat_secondary),
        "search_web" => bulkhead_for(provider, bulkhead_config.search_web),
        "search_products" => bulkhead_for(provider, bulkhead_config.search_products),
        "search_global" => bulkhead_for(provider, bulkhead_config.search_global),
        _ => bulkhead_for(provider, bulkhead_config.chat_primary),
    });
    let router = Arc::new(ProviderRouter::new(
        client,
        breakers,
        config.circuit_breakers.clone(),
        bulkheads,
        config.flags.provider_failover_enabled,
        Arc::new(|_event| {}),
    ));

    let tool_job_bulkhead = bulkhead_for("tool_job_worker", config.bulkheads.tool_job_worker);
    let queue = Arc::new(ToolQueue::new(config.tool_queue.clone(), tool_job_bulkhead, Arc::new(|_event| {})));

    let state = AppState { config, rate_limiter, admission, router, replay, queue };
    let app = sendcat_http::router(state);

    let addr = listen_addr();
    tracing::info!(%addr, "chat gateway listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
