//! TTL-leased bulkhead for concurrency limiting (component E).
//!
//! Unlike a RAII semaphore permit, a bulkhead lease here is a queryable,
//! independently reclaimable record (§3 `BulkheadLease`): `acquire_slot`
//! hands back a lease id and a guard that releases it on drop, but a lease
//! that outlives its TTL — a caller that panics before the guard drops, a
//! task aborted without running destructors — is reclaimed the next time
//! any caller touches the bulkhead, and can also be swept explicitly via
//! `cleanup_expired`. `list_in_flight` lets the ops snapshot (component J)
//! show exactly what's occupying a bulkhead right now.

use crate::clock::{Clock, MonotonicClock};
use crate::telemetry::{BulkheadEvent, PolicyEvent};
use crate::ResilienceError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct LeaseRecord {
    acquired_at_millis: u64,
    ttl_ms: u64,
}

/// Point-in-time view of one occupied slot, for `list_in_flight`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkheadLeaseInfo {
    pub lease_id: String,
    pub provider: String,
    pub age_ms: u64,
    pub ttl_ms: u64,
}

/// A provider-scoped, TTL-leased concurrency limiter.
#[derive(Clone)]
pub struct Bulkhead {
    provider: Arc<str>,
    max_concurrent: usize,
    lease_ttl: Duration,
    leases: Arc<Mutex<HashMap<Uuid, LeaseRecord>>>,
    clock: Arc<dyn Clock>,
}

/// Held by a caller between `acquire_slot` and the end of its critical
/// section; releases the lease on drop.
pub struct BulkheadGuard {
    bulkhead: Bulkhead,
    lease_id: Uuid,
    released: bool,
}

impl BulkheadGuard {
    pub fn lease_id(&self) -> Uuid {
        self.lease_id
    }

    /// Explicitly release before drop, e.g. to emit a telemetry event with
    /// context unavailable to `Drop`.
    pub fn release(mut self) {
        self.bulkhead.release_slot(self.lease_id);
        self.released = true;
    }
}

impl Drop for BulkheadGuard {
    fn drop(&mut self) {
        if !self.released {
            self.bulkhead.release_slot(self.lease_id);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadRejectedError {
    pub active: usize,
    pub max_concurrency: usize,
}

impl std::fmt::Display for BulkheadRejectedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bulkhead saturated: {}/{} in flight", self.active, self.max_concurrency)
    }
}

impl std::error::Error for BulkheadRejectedError {}

impl Bulkhead {
    pub fn new(provider: impl Into<Arc<str>>, max_concurrent: usize, lease_ttl: Duration) -> Self {
        Self {
            provider: provider.into(),
            max_concurrent,
            lease_ttl,
            leases: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    pub fn unlimited(provider: impl Into<Arc<str>>) -> Self {
        Self::new(provider, 1_000_000_000, Duration::from_secs(3600))
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrent
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    fn reclaim_expired_locked(&self, leases: &mut HashMap<Uuid, LeaseRecord>) -> Vec<Uuid> {
        let now = self.now_millis();
        let expired: Vec<Uuid> = leases
            .iter()
            .filter(|(_, rec)| now.saturating_sub(rec.acquired_at_millis) >= rec.ttl_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            leases.remove(id);
        }
        expired
    }

    /// Reclaim every lease past its TTL. Returns how many were reclaimed.
    /// Safe to call on a timer in addition to the lazy reclamation that
    /// happens inside `acquire_slot`.
    pub fn cleanup_expired(&self, sink: &impl Fn(PolicyEvent)) -> usize {
        let mut leases = self.leases.lock().unwrap();
        let expired = self.reclaim_expired_locked(&mut leases);
        for id in &expired {
            sink(PolicyEvent::Bulkhead(BulkheadEvent::LeaseExpired {
                provider: self.provider.to_string(),
                lease_id: id.to_string(),
            }));
        }
        expired.len()
    }

    /// Attempt to acquire a slot. Lazily reclaims expired leases first, so a
    /// caller can never be rejected purely because of stale leases nobody
    /// swept yet.
    pub fn acquire_slot(&self, sink: &impl Fn(PolicyEvent)) -> Result<BulkheadGuard, BulkheadRejectedError> {
        let mut leases = self.leases.lock().unwrap();
        self.reclaim_expired_locked(&mut leases);

        if leases.len() >= self.max_concurrent {
            let err = BulkheadRejectedError { active: leases.len(), max_concurrency: self.max_concurrent };
            sink(PolicyEvent::Bulkhead(BulkheadEvent::Rejected {
                provider: self.provider.to_string(),
                active: err.active,
                max_concurrency: err.max_concurrency,
            }));
            return Err(err);
        }

        let lease_id = Uuid::new_v4();
        leases.insert(
            lease_id,
            LeaseRecord { acquired_at_millis: self.now_millis(), ttl_ms: self.lease_ttl.as_millis() as u64 },
        );
        sink(PolicyEvent::Bulkhead(BulkheadEvent::Acquired {
            provider: self.provider.to_string(),
            active: leases.len(),
            max_concurrency: self.max_concurrent,
        }));

        Ok(BulkheadGuard { bulkhead: self.clone(), lease_id, released: false })
    }

    /// Release a slot by lease id. Returns `false` if the lease was already
    /// gone (released twice, or reclaimed by TTL already).
    pub fn release_slot(&self, lease_id: Uuid) -> bool {
        let mut leases = self.leases.lock().unwrap();
        let removed = leases.remove(&lease_id).is_some();
        removed
    }

    pub fn in_flight(&self) -> usize {
        self.leases.lock().unwrap().len()
    }

    /// Snapshot of every occupied slot, for the ops endpoint.
    pub fn list_in_flight(&self) -> Vec<BulkheadLeaseInfo> {
        let leases = self.leases.lock().unwrap();
        let now = self.now_millis();
        leases
            .iter()
            .map(|(id, rec)| BulkheadLeaseInfo {
                lease_id: id.to_string(),
                provider: self.provider.to_string(),
                age_ms: now.saturating_sub(rec.acquired_at_millis),
                ttl_ms: rec.ttl_ms,
            })
            .collect()
    }

    /// Wraps an async operation with acquire/release, matching the stack's
    /// `execute` idiom used by the circuit breaker and timeout policies.
    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let noop = |_event: PolicyEvent| {};
        let guard = self.acquire_slot(&noop).map_err(|e| ResilienceError::Bulkhead {
            in_flight: e.active,
            max: e.max_concurrency,
        })?;

        let result = operation().await;
        drop(guard);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);
    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }
    impl std::error::Error for TestError {}

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }
    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(0)) }
        }
        fn advance(&self, ms: u64) {
            self.now.fetch_add(ms, Ordering::SeqCst);
        }
    }
    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    fn noop(_e: PolicyEvent) {}

    #[test]
    fn acquire_and_release_tracks_in_flight() {
        let b = Bulkhead::new("chat_primary", 2, Duration::from_secs(60));
        let g1 = b.acquire_slot(&noop).unwrap();
        assert_eq!(b.in_flight(), 1);
        let g2 = b.acquire_slot(&noop).unwrap();
        assert_eq!(b.in_flight(), 2);
        assert!(b.acquire_slot(&noop).is_err());
        drop(g1);
        assert_eq!(b.in_flight(), 1);
        drop(g2);
        assert_eq!(b.in_flight(), 0);
    }

    #[test]
    fn expired_lease_is_reclaimed_lazily() {
        let clock = ManualClock::new();
        let b = Bulkhead::new("chat_primary", 1, Duration::from_millis(50)).with_clock(clock.clone());
        let g = b.acquire_slot(&noop).unwrap();
        std::mem::forget(g); // simulate a leaked guard
        assert_eq!(b.in_flight(), 1);
        assert!(b.acquire_slot(&noop).is_err());

        clock.advance(60);
        // Lazy reclaim happens on the next acquire attempt.
        let g2 = b.acquire_slot(&noop).unwrap();
        assert_eq!(b.in_flight(), 1);
        drop(g2);
    }

    #[test]
    fn cleanup_expired_reclaims_without_an_acquire_attempt() {
        let clock = ManualClock::new();
        let b = Bulkhead::new("chat_primary", 1, Duration::from_millis(50)).with_clock(clock.clone());
        let g = b.acquire_slot(&noop).unwrap();
        std::mem::forget(g);
        clock.advance(60);
        assert_eq!(b.cleanup_expired(&noop), 1);
        assert_eq!(b.in_flight(), 0);
    }

    #[test]
    fn list_in_flight_reports_age_and_ttl() {
        let clock = ManualClock::new();
        let b = Bulkhead::new("search_web", 2, Duration::from_millis(1000)).with_clock(clock.clone());
        let _g = b.acquire_slot(&noop).unwrap();
        clock.advance(40);
        let infos = b.list_in_flight();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].provider, "search_web");
        assert_eq!(infos[0].age_ms, 40);
        assert_eq!(infos[0].ttl_ms, 1000);
    }

    #[tokio::test]
    async fn execute_acquires_and_releases_around_operation() {
        let b = Bulkhead::new("chat_primary", 1, Duration::from_secs(60));
        let result = b.execute(|| async { Ok::<_, ResilienceError<TestError>>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(b.in_flight(), 0);
    }

    #[tokio::test]
    async fn execute_rejects_at_capacity() {
        let b = Bulkhead::new("chat_primary", 1, Duration::from_secs(60));
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let b_clone = b.clone();
        let barrier_clone = barrier.clone();
        let handle = tokio::spawn(async move {
            b_clone
                .execute(|| {
                    let barrier = barrier_clone.clone();
                    async move {
                        barrier.wait().await;
                        tokio::time::sleep(Duration::from_millis(80)).await;
                        Ok::<_, ResilienceError<TestError>>(())
                    }
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        barrier.wait().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let rejected = b.execute(|| async { Ok::<_, ResilienceError<TestError>>(()) }).await;
        assert!(rejected.unwrap_err().is_bulkhead());

        handle.await.unwrap().unwrap();
    }

    #[test]
    fn concurrency_counter_is_accurate_under_many_acquires() {
        let b = Bulkhead::new("chat_primary", 5, Duration::from_secs(60));
        let max_observed = Arc::new(AtomicUsize::new(0));
        let mut guards = vec![];
        for _ in 0..5 {
            guards.push(b.acquire_slot(&noop).unwrap());
            max_observed.fetch_max(b.in_flight(), Ordering::SeqCst);
        }
        assert!(b.acquire_slot(&noop).is_err());
        assert_eq!(max_observed.load(Ordering::SeqCst), 5);
    }
}
