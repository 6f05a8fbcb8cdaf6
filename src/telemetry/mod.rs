//! Telemetry and observability for the gateway's components.
//!
//! Every component emits structured events through the same `PolicyEvent`
//! enum. Events flow through `TelemetrySink` implementations which can log,
//! aggregate, export to JSONL, or forward to Prometheus/Sentry.
//!
//! # Event Types
//!
//! - **Rate limit** (B): `Allowed`, `Throttled`, `Alert`
//! - **Replay guard** (C): `Claimed`, `Duplicate`, `FailedOpen`
//! - **Circuit breaker** (D): `Opened`, `HalfOpen`, `Closed`, `ProbeFailed`
//! - **Bulkhead** (E): `Acquired`, `Rejected`, `Released`, `LeaseExpired`
//! - **Admission** (F): `Granted`, `Denied`, `Released`, `BackendUnavailable`
//! - **Tool queue** (G): `Enqueued`, `Claimed`, `Completed`, `Failed`, `DeadLettered`, `Requeued`, `HealthAlert`
//! - **Router** (H): `RouteSelected`, `Failover`, `UpstreamError`, `AllRoutesExhausted`
//! - **All components**: `RequestSuccess`, `RequestFailure`
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait defines how events are consumed. It's implemented
//! as a `tower::Service<PolicyEvent>` for composability.

pub mod events;
pub mod sinks;

pub use events::{
    AdmissionDenyReason, AdmissionEvent, BulkheadEvent, CircuitBreakerEvent, PolicyEvent,
    QueueEvent, RateLimitEvent, ReplayEvent, RequestOutcome, RouterEvent, event_to_json,
};
pub use sinks::{
    emit_best_effort, ComposedSinkError, FallbackSink, LogSink, MemorySink, MulticastSink,
    NonBlockingSink, NullSink, StreamingSink, TelemetrySink,
};

#[cfg(test)]
mod tests {
    // Tests live in the submodules (events.rs and sinks.rs).
}