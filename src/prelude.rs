//! Convenient re-exports for the gateway's reliability primitives.
pub use crate::{
    admission::{AdmissionControl, AdmissionMode, AdmissionResult},
    bulkhead::{Bulkhead, BulkheadGuard, BulkheadRejectedError},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitState},
    circuit_breaker_registry::CircuitBreakerRegistry,
    config::Config,
    ops::{OpsSnapshot, ReliabilitySnapshot, SnapshotRequest},
    rate_limit::{RateLimitOutcome, RateLimiter},
    replay::{ReplayGuard, ReplayOutcome},
    telemetry::{
        AdmissionEvent, BulkheadEvent, CircuitBreakerEvent, LogSink, MemorySink, NullSink,
        PolicyEvent, QueueEvent, RateLimitEvent, ReplayEvent, RequestOutcome, RouterEvent,
        TelemetrySink,
    },
    ResilienceError,
};
