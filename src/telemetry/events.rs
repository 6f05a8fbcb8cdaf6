use std::fmt;
use std::time::Duration;

use serde_json::json;

/// Structured events emitted by gateway components.
///
/// Every component emits through the same `PolicyEvent` enum so a single
/// `TelemetrySink` can observe the whole gateway without component-specific
/// wiring.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    RateLimit(RateLimitEvent),
    Replay(ReplayEvent),
    CircuitBreaker(CircuitBreakerEvent),
    Bulkhead(BulkheadEvent),
    Admission(AdmissionEvent),
    Queue(QueueEvent),
    Router(RouterEvent),
    Request(RequestOutcome),
}

/// Events emitted by the rate-limit primitive (component B).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    /// A request was allowed under the bucket's window.
    Allowed { bucket: String, count: u64, limit: u64 },
    /// A request was throttled; `retry_after_ms` mirrors the resolved header.
    Throttled { bucket: String, count: u64, limit: u64, retry_after_ms: u64 },
    /// The 5-minute rolling alert threshold was crossed for a bucket.
    Alert { bucket: String, throttled_count: u64, window_minutes: u64 },
}

/// Events emitted by the idempotency replay guard (component C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayEvent {
    /// A fresh key was claimed; the caller should proceed.
    Claimed,
    /// A previously-claimed key was seen again; the caller should skip
    /// re-execution and return the cached outcome.
    Duplicate,
    /// The replay store was unavailable; the guard failed open.
    FailedOpen,
}

/// Events emitted by circuit breaker policies, one breaker per provider/route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// Circuit transitioned to open state for `provider`.
    Opened { provider: String, failure_count: usize, cooldown_ms: u64 },
    /// Circuit transitioned to half-open state, allowing one probe through.
    HalfOpen { provider: String },
    /// Circuit transitioned (back) to closed state.
    Closed { provider: String },
    /// A probe sent while half-open failed; cooldown doubles (capped).
    ProbeFailed { provider: String, next_cooldown_ms: u64 },
}

/// Events emitted by the TTL-leased bulkhead (component E).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkheadEvent {
    Acquired { provider: String, active: usize, max_concurrency: usize },
    Rejected { provider: String, active: usize, max_concurrency: usize },
    Released { provider: String, active: usize },
    /// A lease was reclaimed after its TTL expired without an explicit release.
    LeaseExpired { provider: String, lease_id: String },
}

/// Events emitted by the Redis-backed admission gate (component F).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    Granted { ticket_id: String, shadow: bool },
    Denied { reason: AdmissionDenyReason, shadow: bool, retry_after_ms: u64 },
    Released { ticket_id: String },
    /// Redis was unreachable; admission failed open or closed per config.
    BackendUnavailable { failed_closed: bool },
}

/// Which admission check rejected the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDenyReason {
    UserInflight,
    GlobalInflight,
    GlobalMsgRate,
    GlobalToolRate,
    /// The backend (Redis) was unreachable; the gate failed closed.
    RedisUnavailable,
}

impl AdmissionDenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionDenyReason::UserInflight => "user_inflight",
            AdmissionDenyReason::GlobalInflight => "global_inflight",
            AdmissionDenyReason::GlobalMsgRate => "global_msg_rate",
            AdmissionDenyReason::GlobalToolRate => "global_tool_rate",
            AdmissionDenyReason::RedisUnavailable => "redis_unavailable",
        }
    }
}

/// Events emitted by the tool-job queue (component G).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Enqueued { job_id: String, tool: String, qos: String },
    Claimed { job_id: String, tool: String, attempt: u32 },
    Completed { job_id: String, tool: String },
    Failed { job_id: String, tool: String, attempt: u32, will_retry: bool },
    DeadLettered { job_id: String, tool: String, attempts: u32 },
    Requeued { job_id: String, tool: String },
    /// Emitted by `monitorQueueHealth` when any alert threshold is crossed.
    HealthAlert { alert: String, value: u64, threshold: u64 },
}

/// Events emitted by the provider router (component H).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    RouteSelected { route: String, model_class: String },
    Failover { from_route: String, to_route: String, reason: String },
    UpstreamError { route: String, code: String },
    AllRoutesExhausted { routes_tried: usize },
}

/// Request outcome events emitted by all policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success { duration: Duration },
    Failure { duration: Duration },
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::RateLimit(e) => write!(f, "RateLimit::{}", e),
            PolicyEvent::Replay(e) => write!(f, "Replay::{}", e),
            PolicyEvent::CircuitBreaker(e) => write!(f, "CircuitBreaker::{}", e),
            PolicyEvent::Bulkhead(e) => write!(f, "Bulkhead::{}", e),
            PolicyEvent::Admission(e) => write!(f, "Admission::{}", e),
            PolicyEvent::Queue(e) => write!(f, "Queue::{}", e),
            PolicyEvent::Router(e) => write!(f, "Router::{}", e),
            PolicyEvent::Request(e) => write!(f, "Request::{}", e),
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Allowed { bucket, count, limit } => {
                write!(f, "Allowed({bucket}, {count}/{limit})")
            }
            RateLimitEvent::Throttled { bucket, count, limit, retry_after_ms } => {
                write!(f, "Throttled({bucket}, {count}/{limit}, retry_after={retry_after_ms}ms)")
            }
            RateLimitEvent::Alert { bucket, throttled_count, window_minutes } => {
                write!(f, "Alert({bucket}, throttled={throttled_count}, window={window_minutes}m)")
            }
        }
    }
}

impl fmt::Display for ReplayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayEvent::Claimed => write!(f, "Claimed"),
            ReplayEvent::Duplicate => write!(f, "Duplicate"),
            ReplayEvent::FailedOpen => write!(f, "FailedOpen"),
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { provider, failure_count, cooldown_ms } => {
                write!(f, "Opened({provider}, failures={failure_count}, cooldown={cooldown_ms}ms)")
            }
            CircuitBreakerEvent::HalfOpen { provider } => write!(f, "HalfOpen({provider})"),
            CircuitBreakerEvent::Closed { provider } => write!(f, "Closed({provider})"),
            CircuitBreakerEvent::ProbeFailed { provider, next_cooldown_ms } => {
                write!(f, "ProbeFailed({provider}, next_cooldown={next_cooldown_ms}ms)")
            }
        }
    }
}

impl fmt::Display for BulkheadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BulkheadEvent::Acquired { provider, active, max_concurrency } => {
                write!(f, "Acquired({provider}, {active}/{max_concurrency})")
            }
            BulkheadEvent::Rejected { provider, active, max_concurrency } => {
                write!(f, "Rejected({provider}, {active}/{max_concurrency})")
            }
            BulkheadEvent::Released { provider, active } => {
                write!(f, "Released({provider}, active={active})")
            }
            BulkheadEvent::LeaseExpired { provider, lease_id } => {
                write!(f, "LeaseExpired({provider}, lease={lease_id})")
            }
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Granted { ticket_id, shadow } => {
                write!(f, "Granted(ticket={ticket_id}, shadow={shadow})")
            }
            AdmissionEvent::Denied { reason, shadow, retry_after_ms } => {
                write!(f, "Denied({}, shadow={shadow}, retry_after={retry_after_ms}ms)", reason.as_str())
            }
            AdmissionEvent::Released { ticket_id } => write!(f, "Released(ticket={ticket_id})"),
            AdmissionEvent::BackendUnavailable { failed_closed } => {
                write!(f, "BackendUnavailable(failed_closed={failed_closed})")
            }
        }
    }
}

impl fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueEvent::Enqueued { job_id, tool, qos } => write!(f, "Enqueued({job_id}, {tool}, {qos})"),
            QueueEvent::Claimed { job_id, tool, attempt } => {
                write!(f, "Claimed({job_id}, {tool}, attempt={attempt})")
            }
            QueueEvent::Completed { job_id, tool } => write!(f, "Completed({job_id}, {tool})"),
            QueueEvent::Failed { job_id, tool, attempt, will_retry } => {
                write!(f, "Failed({job_id}, {tool}, attempt={attempt}, will_retry={will_retry})")
            }
            QueueEvent::DeadLettered { job_id, tool, attempts } => {
                write!(f, "DeadLettered({job_id}, {tool}, attempts={attempts})")
            }
            QueueEvent::Requeued { job_id, tool } => write!(f, "Requeued({job_id}, {tool})"),
            QueueEvent::HealthAlert { alert, value, threshold } => {
                write!(f, "HealthAlert({alert}, {value}>{threshold})")
            }
        }
    }
}

impl fmt::Display for RouterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterEvent::RouteSelected { route, model_class } => {
                write!(f, "RouteSelected({route}, {model_class})")
            }
            RouterEvent::Failover { from_route, to_route, reason } => {
                write!(f, "Failover({from_route}->{to_route}, {reason})")
            }
            RouterEvent::UpstreamError { route, code } => write!(f, "UpstreamError({route}, {code})"),
            RouterEvent::AllRoutesExhausted { routes_tried } => {
                write!(f, "AllRoutesExhausted(tried={routes_tried})")
            }
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { duration } => write!(f, "Success(duration={:?})", duration),
            RequestOutcome::Failure { duration } => write!(f, "Failure(duration={:?})", duration),
        }
    }
}

#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a `PolicyEvent` into a JSON value, used by JSONL export and the
/// Sentry envelope sink.
pub fn event_to_json(event: &PolicyEvent) -> serde_json::Value {
    match event {
        PolicyEvent::RateLimit(e) => match e {
            RateLimitEvent::Allowed { bucket, count, limit } => json!({
                "kind": "rate_limit_allowed", "bucket": bucket, "count": count, "limit": limit
            }),
            RateLimitEvent::Throttled { bucket, count, limit, retry_after_ms } => json!({
                "kind": "rate_limit_throttled", "bucket": bucket, "count": count,
                "limit": limit, "retry_after_ms": retry_after_ms
            }),
            RateLimitEvent::Alert { bucket, throttled_count, window_minutes } => json!({
                "kind": "rate_limit_alert", "bucket": bucket,
                "throttled_count": throttled_count, "window_minutes": window_minutes
            }),
        },
        PolicyEvent::Replay(e) => json!({ "kind": "replay", "outcome": e.to_string() }),
        PolicyEvent::CircuitBreaker(e) => match e {
            CircuitBreakerEvent::Opened { provider, failure_count, cooldown_ms } => json!({
                "kind": "circuit_opened", "provider": provider,
                "failures": failure_count, "cooldown_ms": cooldown_ms
            }),
            CircuitBreakerEvent::HalfOpen { provider } => json!({ "kind": "circuit_half_open", "provider": provider }),
            CircuitBreakerEvent::Closed { provider } => json!({ "kind": "circuit_closed", "provider": provider }),
            CircuitBreakerEvent::ProbeFailed { provider, next_cooldown_ms } => json!({
                "kind": "circuit_probe_failed", "provider": provider, "next_cooldown_ms": next_cooldown_ms
            }),
        },
        PolicyEvent::Bulkhead(e) => match e {
            BulkheadEvent::Acquired { provider, active, max_concurrency } => json!({
                "kind": "bulkhead_acquired", "provider": provider, "active": active, "max": max_concurrency
            }),
            BulkheadEvent::Rejected { provider, active, max_concurrency } => json!({
                "kind": "bulkhead_rejected", "provider": provider, "active": active, "max": max_concurrency
            }),
            BulkheadEvent::Released { provider, active } => json!({
                "kind": "bulkhead_released", "provider": provider, "active": active
            }),
            BulkheadEvent::LeaseExpired { provider, lease_id } => json!({
                "kind": "bulkhead_lease_expired", "provider": provider, "lease_id": lease_id
            }),
        },
        PolicyEvent::Admission(e) => match e {
            AdmissionEvent::Granted { ticket_id, shadow } => json!({
                "kind": "admission_granted", "ticket_id": ticket_id, "shadow": shadow
            }),
            AdmissionEvent::Denied { reason, shadow, retry_after_ms } => json!({
                "kind": "admission_denied", "reason": reason.as_str(),
                "shadow": shadow, "retry_after_ms": retry_after_ms
            }),
            AdmissionEvent::Released { ticket_id } => json!({ "kind": "admission_released", "ticket_id": ticket_id }),
            AdmissionEvent::BackendUnavailable { failed_closed } => json!({
                "kind": "admission_backend_unavailable", "failed_closed": failed_closed
            }),
        },
        PolicyEvent::Queue(e) => match e {
            QueueEvent::Enqueued { job_id, tool, qos } => json!({
                "kind": "queue_enqueued", "job_id": job_id, "tool": tool, "qos": qos
            }),
            QueueEvent::Claimed { job_id, tool, attempt } => json!({
                "kind": "queue_claimed", "job_id": job_id, "tool": tool, "attempt": attempt
            }),
            QueueEvent::Completed { job_id, tool } => json!({
                "kind": "queue_completed", "job_id": job_id, "tool": tool
            }),
            QueueEvent::Failed { job_id, tool, attempt, will_retry } => json!({
                "kind": "queue_failed", "job_id": job_id, "tool": tool,
                "attempt": attempt, "will_retry": will_retry
            }),
            QueueEvent::DeadLettered { job_id, tool, attempts } => json!({
                "kind": "queue_dead_lettered", "job_id": job_id, "tool": tool, "attempts": attempts
            }),
            QueueEvent::Requeued { job_id, tool } => json!({
                "kind": "queue_requeued", "job_id": job_id, "tool": tool
            }),
            QueueEvent::HealthAlert { alert, value, threshold } => json!({
                "kind": "queue_health_alert", "alert": alert, "value": value, "threshold": threshold
            }),
        },
        PolicyEvent::Router(e) => match e {
            RouterEvent::RouteSelected { route, model_class } => json!({
                "kind": "router_route_selected", "route": route, "model_class": model_class
            }),
            RouterEvent::Failover { from_route, to_route, reason } => json!({
                "kind": "router_failover", "from": from_route, "to": to_route, "reason": reason
            }),
            RouterEvent::UpstreamError { route, code } => json!({
                "kind": "router_upstream_error", "route": route, "code": code
            }),
            RouterEvent::AllRoutesExhausted { routes_tried } => json!({
                "kind": "router_all_routes_exhausted", "routes_tried": routes_tried
            }),
        },
        PolicyEvent::Request(r) => match r {
            RequestOutcome::Success { duration } => json!({
                "kind": "request_success", "duration_ms": clamp_u64(duration.as_millis())
            }),
            RequestOutcome::Failure { duration } => json!({
                "kind": "request_failure", "duration_ms": clamp_u64(duration.as_millis())
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_throttled_json_has_retry_after() {
        let v = event_to_json(&PolicyEvent::RateLimit(RateLimitEvent::Throttled {
            bucket: "chat_stream_session".into(),
            count: 21,
            limit: 20,
            retry_after_ms: 1500,
        }));
        assert_eq!(v["kind"], "rate_limit_throttled");
        assert_eq!(v["retry_after_ms"], 1500);
    }

    #[test]
    fn circuit_opened_json_carries_cooldown() {
        let v = event_to_json(&PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Opened {
            provider: "chat_primary".into(),
            failure_count: 5,
            cooldown_ms: 30_000,
        }));
        assert_eq!(v["kind"], "circuit_opened");
        assert_eq!(v["cooldown_ms"], 30_000);
    }

    #[test]
    fn admission_denied_json_carries_reason_string() {
        let v = event_to_json(&PolicyEvent::Admission(AdmissionEvent::Denied {
            reason: AdmissionDenyReason::GlobalInflight,
            shadow: false,
            retry_after_ms: 1000,
        }));
        assert_eq!(v["reason"], "global_inflight");
    }

    #[test]
    fn policy_event_clone_and_eq() {
        let event = PolicyEvent::Queue(QueueEvent::Enqueued {
            job_id: "j1".into(),
            tool: "web_search".into(),
            qos: "standard".into(),
        });
        let cloned = event.clone();
        assert_eq!(event, cloned);
    }

    #[test]
    fn display_impls_are_human_readable() {
        let e = PolicyEvent::Router(RouterEvent::Failover {
            from_route: "chat_primary".into(),
            to_route: "chat_secondary".into(),
            reason: "circuit_open".into(),
        });
        assert!(e.to_string().contains("chat_primary->chat_secondary"));
    }

    #[test]
    fn telemetry_json_never_carries_prompt_or_message_bodies() {
        let v = event_to_json(&PolicyEvent::Request(RequestOutcome::Success {
            duration: Duration::from_millis(1),
        }));
        let s = serde_json::to_string(&v).unwrap();
        assert!(!s.contains("message") && !s.contains("prompt"));
    }
}
