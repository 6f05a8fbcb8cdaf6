//! Per-provider circuit breaker with lock-free atomics (component D).
//!
//! One `CircuitBreaker` instance guards one upstream route (`chat_primary`,
//! `search_web`, ...). State transitions are the classic three-state machine
//! — closed, open, half-open — with one addition the chat gateway spec
//! requires: a half-open probe that fails doubles the next cooldown, capped
//! at 2x the configured base, instead of reopening at the same duration
//! forever.

use crate::clock::{Clock, MonotonicClock};
use crate::telemetry::{CircuitBreakerEvent, PolicyEvent};
use crate::ResilienceError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Static configuration for one breaker (§4.D, `CIRCUIT_<ROUTE>_{THRESHOLD,COOLDOWN_MS}`).
#[derive(Clone, Copy, Debug)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub base_cooldown: Duration,
    pub max_cooldown_multiplier: u32,
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: usize, base_cooldown: Duration) -> Self {
        Self { failure_threshold, base_cooldown, max_cooldown_multiplier: 2 }
    }

    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            base_cooldown: Duration::from_secs(0),
            max_cooldown_multiplier: 1,
        }
    }
}

pub(crate) struct CircuitBreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    cooldown_multiplier: AtomicU64,
}

impl CircuitBreakerState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            opened_at_millis: AtomicU64::new(0),
            cooldown_multiplier: AtomicU64::new(1),
        })
    }

    pub(crate) fn current_state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    pub(crate) fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.opened_at_millis.store(0, Ordering::Release);
        self.cooldown_multiplier.store(1, Ordering::Release);
    }

    pub(crate) fn failure_count(&self) -> usize {
        self.failure_count.load(Ordering::Acquire)
    }
}

/// A provider-scoped circuit breaker (§3 CircuitBreakerState, §4.D).
#[derive(Clone)]
pub struct CircuitBreaker {
    provider: Arc<str>,
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

/// Error returned by [`CircuitBreaker::check_gate`] and `execute` when the
/// circuit is open or the half-open probe slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpenError {
    pub failure_count: usize,
    pub open_duration: Duration,
}

impl std::fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "circuit open: {} consecutive failures, open for {:?}",
            self.failure_count, self.open_duration
        )
    }
}

impl std::error::Error for CircuitOpenError {}

impl CircuitBreaker {
    pub fn new(provider: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            state: CircuitBreakerState::new(),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn state(&self) -> CircuitState {
        self.state.current_state()
    }

    pub fn reset(&self) {
        self.state.reset();
    }

    fn cooldown(&self) -> Duration {
        let mult = self.state.cooldown_multiplier.load(Ordering::Acquire).max(1);
        self.config.base_cooldown.saturating_mul(mult as u32)
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Check whether a call may proceed. Mirrors the spec's `checkGate`:
    /// returns `Ok(())` when closed or when this caller won the half-open
    /// probe slot, `Err` otherwise. Callers that get `Ok` must follow up
    /// with `record_success`/`record_failure`.
    pub fn check_gate(&self) -> Result<(), CircuitOpenError> {
        loop {
            let current = self.state.state.load(Ordering::Acquire);
            match current {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.now_millis().saturating_sub(opened_at);
                    let cooldown_ms = self.cooldown().as_millis() as u64;

                    if elapsed >= cooldown_ms {
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                tracing::info!(provider = %self.provider, "circuit breaker -> half_open");
                                return Ok(());
                            }
                            Err(STATE_HALF_OPEN) => {
                                return Err(CircuitOpenError {
                                    failure_count: self.state.failure_count(),
                                    open_duration: Duration::from_millis(elapsed),
                                });
                            }
                            Err(STATE_CLOSED) => return Ok(()),
                            Err(_) => unreachable!("invalid circuit breaker transition"),
                        }
                    } else {
                        return Err(CircuitOpenError {
                            failure_count: self.state.failure_count(),
                            open_duration: Duration::from_millis(elapsed),
                        });
                    }
                }
                STATE_HALF_OPEN => {
                    // Only one probe is allowed through at a time.
                    return Err(CircuitOpenError {
                        failure_count: self.state.failure_count(),
                        open_duration: Duration::from_millis(0),
                    });
                }
                STATE_CLOSED => return Ok(()),
                _ => unreachable!("invalid circuit breaker state"),
            }
        }
    }

    pub fn record_success(&self, sink: &impl Fn(PolicyEvent)) {
        let current = self.state.state.load(Ordering::Acquire);
        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.reset();
                    tracing::info!(provider = %self.provider, "circuit breaker -> closed");
                    sink(PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Closed {
                        provider: self.provider.to_string(),
                    }));
                }
            }
            STATE_CLOSED => {
                self.state.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    pub fn record_failure(&self, sink: &impl Fn(PolicyEvent)) {
        let current = self.state.state.load(Ordering::Acquire);
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match current {
            STATE_HALF_OPEN => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                    let next_mult = (self.state.cooldown_multiplier.load(Ordering::Acquire) * 2)
                        .min(self.config.max_cooldown_multiplier as u64);
                    self.state.cooldown_multiplier.store(next_mult, Ordering::Release);
                    let next_cooldown_ms = self.cooldown().as_millis() as u64;
                    tracing::warn!(provider = %self.provider, failures, next_cooldown_ms, "circuit breaker: probe failed -> open");
                    sink(PolicyEvent::CircuitBreaker(CircuitBreakerEvent::ProbeFailed {
                        provider: self.provider.to_string(),
                        next_cooldown_ms,
                    }));
                }
            }
            STATE_CLOSED => {
                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.state.opened_at_millis.store(self.now_millis(), Ordering::Release);
                    self.state.cooldown_multiplier.store(1, Ordering::Release);
                    let cooldown_ms = self.cooldown().as_millis() as u64;
                    tracing::error!(provider = %self.provider, failures, threshold = self.config.failure_threshold, "circuit breaker -> open");
                    sink(PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Opened {
                        provider: self.provider.to_string(),
                        failure_count: failures,
                        cooldown_ms,
                    }));
                }
            }
            _ => {}
        }
    }

    /// Wraps an async operation with the gate-check/record-outcome cycle;
    /// kept for call sites that prefer the `execute` idiom over manual
    /// `check_gate`/`record_*` calls.
    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let noop = |_event: PolicyEvent| {};
        self.check_gate().map_err(|e| ResilienceError::CircuitOpen {
            failure_count: e.failure_count,
            open_duration: e.open_duration,
        })?;

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(&noop),
            Err(_) => self.record_failure(&noop),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64 as TestAtomicU64, Ordering as TestOrdering};

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<TestAtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(TestAtomicU64::new(0)) }
        }
        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, TestOrdering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(TestOrdering::SeqCst)
        }
    }

    fn noop(_e: PolicyEvent) {}

    #[test]
    fn starts_closed_and_allows_calls() {
        let cb = CircuitBreaker::new("chat_primary", CircuitBreakerConfig::new(3, Duration::from_secs(1)));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.check_gate().is_ok());
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("chat_primary", CircuitBreakerConfig::new(3, Duration::from_secs(10)));
        for _ in 0..3 {
            cb.check_gate().unwrap();
            cb.record_failure(&noop);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check_gate().is_err());
    }

    #[test]
    fn half_open_probe_success_closes_circuit() {
        let clock = ManualClock::new();
        let cb = CircuitBreaker::new("chat_primary", CircuitBreakerConfig::new(1, Duration::from_millis(100)))
            .with_clock(clock.clone());
        cb.check_gate().unwrap();
        cb.record_failure(&noop);
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(150);
        cb.check_gate().unwrap(); // wins the half-open probe
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success(&noop);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_failure_doubles_cooldown_then_caps() {
        let clock = ManualClock::new();
        let cb = CircuitBreaker::new("chat_primary", CircuitBreakerConfig::new(1, Duration::from_millis(100)))
            .with_clock(clock.clone());

        cb.check_gate().unwrap();
        cb.record_failure(&noop); // opens, cooldown = 100ms
        clock.advance(100);
        cb.check_gate().unwrap(); // half-open probe #1
        cb.record_failure(&noop); // fails, cooldown -> 200ms (2x, capped at 2x)

        // 100ms isn't enough anymore, still open
        clock.advance(100);
        assert!(cb.check_gate().is_err());

        clock.advance(100); // total 200ms since reopen
        cb.check_gate().unwrap(); // half-open probe #2
        cb.record_failure(&noop); // cooldown multiplier caps at 2x, stays 200ms

        clock.advance(100);
        assert!(cb.check_gate().is_err(), "cooldown should not exceed 2x base");
        clock.advance(100);
        assert!(cb.check_gate().is_ok());
    }

    #[test]
    fn half_open_limits_to_single_probe() {
        let clock = ManualClock::new();
        let cb = CircuitBreaker::new("chat_primary", CircuitBreakerConfig::new(1, Duration::from_millis(100)))
            .with_clock(clock.clone());
        cb.check_gate().unwrap();
        cb.record_failure(&noop);
        clock.advance(150);

        assert!(cb.check_gate().is_ok());
        assert!(cb.check_gate().is_err(), "second concurrent probe must be rejected");
    }

    #[test]
    fn disabled_breaker_never_opens() {
        let cb = CircuitBreaker::new("chat_primary", CircuitBreakerConfig::disabled());
        for _ in 0..1000 {
            cb.check_gate().unwrap();
            cb.record_failure(&noop);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn success_in_closed_state_resets_failure_count() {
        let cb = CircuitBreaker::new("chat_primary", CircuitBreakerConfig::new(3, Duration::from_secs(1)));
        cb.check_gate().unwrap();
        cb.record_failure(&noop);
        cb.check_gate().unwrap();
        cb.record_failure(&noop);
        cb.check_gate().unwrap();
        cb.record_success(&noop);
        assert_eq!(cb.state.failure_count(), 0);
    }

    #[tokio::test]
    async fn execute_wraps_gate_and_outcome_recording() {
        let cb = CircuitBreaker::new("chat_primary", CircuitBreakerConfig::new(1, Duration::from_secs(10)));
        #[derive(Debug)]
        struct E;
        impl std::fmt::Display for E {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "boom")
            }
        }
        impl std::error::Error for E {}

        let result = cb.execute(|| async { Err::<(), _>(ResilienceError::Inner(E)) }).await;
        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        let blocked = cb.execute(|| async { Ok::<_, ResilienceError<E>>(()) }).await;
        assert!(blocked.unwrap_err().is_circuit_open());
    }
}
