#![forbid(unsafe_code)]

//! # sendcat-core
//!
//! Reliability primitives for the chat gateway: rate limiting, idempotency
//! replay guards, per-provider circuit breakers and bulkheads, Redis-backed
//! admission control, a partitioned tool-job queue, and the provider router
//! that ties them together in front of an upstream model API.
//!
//! Every stateful component exposes the same shape: a pure, typed
//! `Config::snapshot()`, an operation that returns a structured outcome
//! rather than throwing, and best-effort telemetry through `PolicyEvent`.
//! Components that must agree across gateway instances (admission, the
//! tool queue) go through a shared backend trait with an in-memory fake for
//! tests; components that can tolerate per-instance divergence (circuit
//! breakers, bulkheads) keep their state in-process.
//!
//! ## Quick start
//!
//! ```rust
//! use std::time::Duration;
//! use sendcat_core::{CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn call_provider() -> Result<(), std::io::Error> { Ok(()) }
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::new("chat_primary", CircuitBreakerConfig::new(5, Duration::from_secs(30)));
//!
//! breaker.check_gate()?;
//! match call_provider().await {
//!     Ok(()) => breaker.record_success(&|_event| {}),
//!     Err(e) => {
//!         breaker.record_failure(&|_event| {});
//!         return Err(e.into());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod admission;
mod alerting;
mod backoff;
mod bulkhead;
mod circuit_breaker;
mod circuit_breaker_registry;
mod clock;
mod config;
mod error;
mod jitter;
mod ops;
mod queue;
mod rate_limit;
mod replay;
mod router;
mod store;
mod telemetry;
mod timeout;

pub use admission::{
    resolve_admission_retry_after_ms, AdmissionBackend, AdmissionControl, AdmissionMode,
    AdmissionResult, IncrOutcome, InMemoryAdmissionBackend,
};
#[cfg(feature = "redis-backend")]
pub use admission::redis_backend::RedisAdmissionBackend;
pub use alerting::{build_envelope, ship_best_effort, AlertShipper, NullShipper};
#[cfg(feature = "sentry-shipping")]
pub use alerting::HttpShipper;
pub use backoff::Backoff;
pub use bulkhead::{Bulkhead, BulkheadGuard, BulkheadLeaseInfo, BulkheadRejectedError};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitState};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use clock::{Clock, MonotonicClock};
pub use config::{
    AdmissionConfig, BulkheadConfigEntry, Bulkheads, ChatRouteConfig, CircuitBreakerConfigEntry,
    CircuitBreakers, Config, FeatureFlags, RateLimitBucketConfig, RateLimitBuckets,
    RedactedConfig, RegionConfig, ToolQueueAlertThresholds, ToolQueueConfig,
};
pub use error::ResilienceError;
pub use jitter::Jitter;
pub use ops::{CircuitBreakerStatus, OpsSnapshot, QueueDepth, ReliabilitySnapshot, SnapshotRequest};
pub use queue::{EnqueueError, JobStatus, ToolJob, ToolQueue, WaitOutcome};
pub use rate_limit::{AlertThreshold, EventSummary, RateLimitOutcome, RateLimiter};
pub use replay::{ReplayGuard, ReplayOutcome};
pub use router::{
    infer_model_class, ClientSafeError, ModelClass, ProviderCallError, ProviderClient,
    ProviderResponse, ProviderRouter, UpstreamErrorCode,
};
pub use store::{
    AlertRow, AlertStore, CacheEntryRow, CacheStore, InMemoryAlertStore, InMemoryCacheStore,
    InMemoryRateLimitStore, InMemoryReplayStore, RateLimitEventRow, RateLimitStore,
    RateLimitWindowRow, ReplayClaimRow, ReplayStore, StoreError, StoreResult,
};
pub use telemetry::{
    emit_best_effort, event_to_json, AdmissionDenyReason, AdmissionEvent, BulkheadEvent,
    CircuitBreakerEvent, ComposedSinkError, FallbackSink, LogSink, MemorySink, MulticastSink,
    NonBlockingSink, NullSink, PolicyEvent, QueueEvent, RateLimitEvent, ReplayEvent,
    RequestOutcome, RouterEvent, StreamingSink, TelemetrySink,
};
pub use timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT};

pub mod prelude;
