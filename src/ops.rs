//! Component J: read-only reliability snapshot.
//!
//! `get_reliability_snapshot` is the one operation this module exposes: a
//! point-in-time aggregation across every other component, assembled
//! without mutating any of them. It backs both an operator-facing endpoint
//! and the release-gate harness that decides whether a canary is healthy
//! enough to promote.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::bulkhead::{Bulkhead, BulkheadLeaseInfo};
use crate::circuit_breaker::CircuitState;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::queue::{JobStatus, ToolQueue};
use crate::rate_limit::{EventSummary, RateLimiter};

/// Parameters for `get_reliability_snapshot`.
#[derive(Clone, Copy, Debug)]
pub struct SnapshotRequest {
    pub minutes: u64,
    pub limit: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircuitBreakerStatus {
    pub provider: String,
    pub state: CircuitState,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueueDepth {
    pub queued: u64,
    pub running: u64,
    pub dead_letter: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReliabilitySnapshot {
    pub generated_at: DateTime<Utc>,
    pub circuit_breakers: Vec<CircuitBreakerStatus>,
    pub bulkhead_in_flight: Vec<BulkheadLeaseInfo>,
    pub queue_depth: QueueDepth,
    pub rate_limit_summaries: Vec<EventSummary>,
}

/// `getReliabilitySnapshot({minutes, limit})`: a cross-component,
/// best-effort view assembled from already-computed in-process state — no
/// component's read path here can deny or mutate a live request.
pub struct OpsSnapshot<'a> {
    pub breakers: &'a CircuitBreakerRegistry,
    pub bulkheads: &'a [Bulkhead],
    pub queue: &'a ToolQueue,
    pub rate_limiter: &'a RateLimiter,
    pub rate_limit_buckets: &'a [&'a str],
}

impl<'a> OpsSnapshot<'a> {
    pub async fn get_reliability_snapshot(&self, request: SnapshotRequest, now: DateTime<Utc>) -> ReliabilitySnapshot {
        let circuit_breakers = self
            .breakers
            .snapshot()
            .into_iter()
            .take(request.limit.max(1))
            .map(|(provider, state)| CircuitBreakerStatus { provider, state })
            .collect();

        let bulkhead_in_flight = self
            .bulkheads
            .iter()
            .flat_map(|b| b.list_in_flight())
            .take(request.limit.max(1))
            .collect();

        let queue_depth = QueueDepth {
            queued: self.queue.count(JobStatus::Queued),
            running: self.queue.count(JobStatus::Running),
            dead_letter: self.queue.count(JobStatus::DeadLetter),
        };

        let window = Duration::from_secs(request.minutes.max(1) * 60);
        let mut rate_limit_summaries = Vec::new();
        for bucket in self.rate_limit_buckets {
            rate_limit_summaries.push(self.rate_limiter.event_summary(bucket, window, now).await);
        }

        ReliabilitySnapshot { generated_at: now, circuit_breakers, bulkhead_in_flight, queue_depth, rate_limit_summaries }
    }
}
