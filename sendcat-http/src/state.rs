use std::sync::Arc;

use sendcat_core::{AdmissionControl, Config, ProviderRouter, RateLimiter, ReplayGuard, ToolQueue};

/// Shared, request-handler-visible state. Each field is independently
/// `Arc`-wrapped so handlers only clone what they touch.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub rate_limiter: Arc<RateLimiter>,
    pub admission: Arc<AdmissionControl>,
    pub router: Arc<ProviderRouter>,
    pub replay: Arc<ReplayGuard>,
    pub queue: Arc<ToolQueue>,
}
