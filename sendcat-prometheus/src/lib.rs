//! Prometheus metrics sink for `sendcat-core`.
//! Bring your own `prometheus::Registry`; counters are registered and incremented.

use sendcat_core::{
    AdmissionEvent, BulkheadEvent, CircuitBreakerEvent, PolicyEvent, QueueEvent, RateLimitEvent,
    ReplayEvent, RequestOutcome, RouterEvent, TelemetrySink,
};
use prometheus::{IntCounterVec, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    counter: IntCounterVec,
}

impl PrometheusSink {
    /// Create a sink and register counters into the provided registry.
    ///
    /// # Errors
    /// Returns an error if the metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let counter = IntCounterVec::new(
            prometheus::Opts::new("sendcat_gateway_events_total", "Gateway policy events"),
            &["policy", "event"],
        )?;
        registry.register(Box::new(counter.clone()))?;
        Ok(Self { registry, counter })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl tower_service::Service<PolicyEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        let (policy_label, event_label) = match &event {
            PolicyEvent::RateLimit(e) => (
                "rate_limit",
                match e {
                    RateLimitEvent::Allowed { .. } => "allowed",
                    RateLimitEvent::Throttled { .. } => "throttled",
                    RateLimitEvent::Alert { .. } => "alert",
                },
            ),
            PolicyEvent::Replay(e) => (
                "replay",
                match e {
                    ReplayEvent::Claimed => "claimed",
                    ReplayEvent::Duplicate => "duplicate",
                    ReplayEvent::FailedOpen => "failed_open",
                },
            ),
            PolicyEvent::CircuitBreaker(e) => (
                "circuit_breaker",
                match e {
                    CircuitBreakerEvent::Opened { .. } => "opened",
                    CircuitBreakerEvent::HalfOpen { .. } => "half_open",
                    CircuitBreakerEvent::Closed { .. } => "closed",
                    CircuitBreakerEvent::ProbeFailed { .. } => "probe_failed",
                },
            ),
            PolicyEvent::Bulkhead(e) => (
                "bulkhead",
                match e {
                    BulkheadEvent::Acquired { .. } => "acquired",
                    BulkheadEvent::Rejected { .. } => "rejected",
                    BulkheadEvent::Released { .. } => "released",
                    BulkheadEvent::LeaseExpired { .. } => "lease_expired",
                },
            ),
            PolicyEvent::Admission(e) => (
                "admission",
                match e {
                    AdmissionEvent::Granted { .. } => "granted",
                    AdmissionEvent::Denied { .. } => "denied",
                    AdmissionEvent::Released { .. } => "released",
                    AdmissionEvent::BackendUnavailable { .. } => "backend_unavailable",
                },
            ),
            PolicyEvent::Queue(e) => (
                "queue",
                match e {
                    QueueEvent::Enqueued { .. } => "enqueued",
                    QueueEvent::Claimed { .. } => "claimed",
                    QueueEvent::Completed { .. } => "completed",
                    QueueEvent::Failed { .. } => "failed",
                    QueueEvent::DeadLettered { .. } => "dead_lettered",
                    QueueEvent::Requeued { .. } => "requeued",
                    QueueEvent::HealthAlert { .. } => "health_alert",
                },
            ),
            PolicyEvent::Router(e) => (
                "router",
                match e {
                    RouterEvent::RouteSelected { .. } => "route_selected",
                    RouterEvent::Failover { .. } => "failover",
                    RouterEvent::UpstreamError { .. } => "upstream_error",
                    RouterEvent::AllRoutesExhausted { .. } => "all_routes_exhausted",
                },
            ),
            PolicyEvent::Request(e) => (
                "request",
                match e {
                    RequestOutcome::Success { .. } => "success",
                    RequestOutcome::Failure { .. } => "failure",
                },
            ),
        };
        let c = self.counter.clone();
        c.with_label_values(&[policy_label, event_label]).inc();
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}
