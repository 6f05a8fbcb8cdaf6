//! Component F: Redis-backed admission control.
//!
//! Four independently-configurable gates (user inflight, global inflight,
//! global message rate, global tool rate) stand between an incoming chat
//! request and the provider router. Each gate is a
//! fixed-window or inflight counter keyed in the shared backend so the
//! limits hold across every gateway instance, not just the one handling
//! the request — the reason this component needs real shared storage where
//! the circuit breaker and bulkhead (component D/E) get away with
//! in-process state.
//!
//! `AdmissionControl` keeps exactly one piece of in-process state: the map
//! from ticket id to the counters it incremented, so `release_admission`
//! knows precisely what to roll back. That map is a bookkeeping aid, not a
//! source of truth — every counter it references lives in the backend with
//! its own TTL, so an abandoned ticket self-heals once its window expires.

pub mod redis_backend;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::AdmissionConfig;
use crate::store::StoreResult;
use crate::telemetry::{AdmissionDenyReason, AdmissionEvent, PolicyEvent};

/// Whether admission decisions actually gate traffic or merely observe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionMode {
    /// Compute what the decision would have been, log it, but always grant.
    Shadow,
    /// Deny requests that fail a gate.
    Enforce,
}

/// Outcome of a single counter check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IncrOutcome {
    pub value: u64,
    pub allowed: bool,
}

/// Shared counter storage for admission gates. Implementations must make
/// `check_and_incr` atomic: a racing pair of callers must never both
/// observe `allowed = true` past `max`.
#[async_trait]
pub trait AdmissionBackend: Send + Sync + 'static {
    async fn check_and_incr(
        &self,
        key: &str,
        by: u64,
        max: u64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<IncrOutcome>;

    /// Decrement `key` by `by`, clamped to zero (`safeDecrement`). Never
    /// errors on a missing key — there is nothing to roll back.
    async fn decr(&self, key: &str, by: u64) -> StoreResult<()>;

    /// Read `key` without mutating it, for shadow-mode's hypothetical check.
    async fn peek(&self, key: &str, now: DateTime<Utc>) -> StoreResult<u64>;
}

struct WindowEntry {
    value: u64,
    expires_at: DateTime<Utc>,
}

/// In-memory `AdmissionBackend`, for tests and single-instance deployments
/// without Redis. Not safe across processes.
#[derive(Default)]
pub struct InMemoryAdmissionBackend {
    windows: Mutex<HashMap<String, WindowEntry>>,
}

#[async_trait]
impl AdmissionBackend for InMemoryAdmissionBackend {
    async fn check_and_incr(&self, key: &str, by: u64, max: u64, ttl: Duration, now: DateTime<Utc>) -> StoreResult<IncrOutcome> {
        let mut windows = self.windows.lock().unwrap();
        let ttl_chrono = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let entry = windows.entry(key.to_string()).or_insert(WindowEntry { value: 0, expires_at: now + ttl_chrono });
        if now >= entry.expires_at {
            entry.value = 0;
            entry.expires_at = now + ttl_chrono;
        }
        if entry.value + by > max {
            return Ok(IncrOutcome { value: entry.value, allowed: false });
        }
        entry.value += by;
        Ok(IncrOutcome { value: entry.value, allowed: true })
    }

    async fn decr(&self, key: &str, by: u64) -> StoreResult<()> {
        let mut windows = self.windows.lock().unwrap();
        if let Some(entry) = windows.get_mut(key) {
            entry.value = entry.value.saturating_sub(by);
        }
        Ok(())
    }

    async fn peek(&self, key: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        let windows = self.windows.lock().unwrap();
        match windows.get(key) {
            Some(entry) if entry.expires_at > now => Ok(entry.value),
            _ => Ok(0),
        }
    }
}

/// `checkAndAcquireAdmission` result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdmissionResult {
    pub granted: bool,
    pub ticket_id: Option<Uuid>,
    pub shadow: bool,
    pub deny_reason: Option<AdmissionDenyReason>,
    pub retry_after_ms: Option<u64>,
}

struct GateSpec {
    reason: AdmissionDenyReason,
    enforce: bool,
    key: String,
    by: u64,
    max: u64,
    ttl: Duration,
}

pub struct AdmissionControl {
    backend: Arc<dyn AdmissionBackend>,
    tickets: Arc<Mutex<HashMap<Uuid, Vec<(String, u64)>>>>,
    sink: Arc<dyn Fn(PolicyEvent) + Send + Sync>,
}

impl AdmissionControl {
    pub fn new(backend: Arc<dyn AdmissionBackend>, sink: Arc<dyn Fn(PolicyEvent) + Send + Sync>) -> Self {
        Self { backend, tickets: Arc::new(Mutex::new(HashMap::new())), sink }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryAdmissionBackend::default()), Arc::new(|_event| {}))
    }

    fn gates(config: &AdmissionConfig, user_id: &str, estimated_tool_calls: u64, now: DateTime<Utc>) -> Vec<GateSpec> {
        let second = now.timestamp();
        let ticket_ttl = Duration::from_millis(config.ticket_ttl_ms);
        vec![
            GateSpec {
                reason: AdmissionDenyReason::UserInflight,
                enforce: config.enforce_user_inflight,
                key: format!("{}:u:inflight:{}", config.key_prefix, user_id),
                by: 1,
                max: config.user_max_inflight,
                ttl: ticket_ttl,
            },
            GateSpec {
                reason: AdmissionDenyReason::GlobalInflight,
                enforce: config.enforce_global_inflight,
                key: format!("{}:g:inflight", config.key_prefix),
                by: 1,
                max: config.global_max_inflight,
                ttl: ticket_ttl,
            },
            GateSpec {
                reason: AdmissionDenyReason::GlobalMsgRate,
                enforce: config.enforce_global_msg_rate,
                key: format!("{}:g:msgrate:{}", config.key_prefix, second),
                by: 1,
                max: config.global_max_msg_per_sec,
                ttl: Duration::from_secs(1),
            },
            GateSpec {
                reason: AdmissionDenyReason::GlobalToolRate,
                enforce: config.enforce_global_tool_rate,
                key: format!("{}:g:toolrate:{}", config.key_prefix, second),
                by: estimated_tool_calls.max(config.estimated_tool_calls_per_msg),
                max: config.global_max_tool_per_sec,
                ttl: Duration::from_secs(1),
            },
        ]
    }

    /// `checkAndAcquireAdmission(userId, estimatedToolCalls)`.
    ///
    /// Walks the four gates in order. On the first denial, rolls back
    /// exactly the counters this call incremented (not the whole gate
    /// list) before returning. In shadow mode, performs the same walk
    /// read-only (via `peek`, never incrementing) purely to observe what
    /// would have happened, and always grants.
    ///
    /// A backend error on any gate always denies with `RedisUnavailable`
    /// (enforce: fail closed; shadow: would-have-blocked) — there is no
    /// config-driven fail-open here. The HTTP layer decides separately
    /// whether to bypass admission entirely on `RedisUnavailable`
    /// (`FeatureFlags::fail_closed_on_redis_error`).
    pub async fn check_and_acquire_admission(
        &self,
        user_id: &str,
        estimated_tool_calls: u64,
        config: &AdmissionConfig,
        mode: AdmissionMode,
        now: DateTime<Utc>,
    ) -> AdmissionResult {
        if !config.enabled {
            return AdmissionResult { granted: true, ticket_id: None, shadow: false, deny_reason: None, retry_after_ms: None };
        }

        let gates = Self::gates(config, user_id, estimated_tool_calls, now);

        if mode == AdmissionMode::Shadow {
            let hypothetical = self.evaluate_shadow(&gates, now).await;
            let ticket_id = Uuid::new_v4();
            (self.sink)(PolicyEvent::Admission(AdmissionEvent::Granted { ticket_id: ticket_id.to_string(), shadow: true }));
            if let Some(reason) = hypothetical {
                let retry_after_ms = retry_after_ms_for(config, reason, rand::random::<f64>());
                tracing::debug!(reason = reason.as_str(), user_id, "admission shadow mode: would have denied");
                (self.sink)(PolicyEvent::Admission(AdmissionEvent::Denied { reason, shadow: true, retry_after_ms }));
            }
            return AdmissionResult { granted: true, ticket_id: Some(ticket_id), shadow: true, deny_reason: None, retry_after_ms: None };
        }

        match self.acquire_enforced(&gates, now).await {
            Ok(acquired) => {
                let ticket_id = Uuid::new_v4();
                self.tickets.lock().unwrap().insert(ticket_id, acquired);
                (self.sink)(PolicyEvent::Admission(AdmissionEvent::Granted { ticket_id: ticket_id.to_string(), shadow: false }));
                AdmissionResult { granted: true, ticket_id: Some(ticket_id), shadow: false, deny_reason: None, retry_after_ms: None }
            }
            Err(reason) => {
                let retry_after_ms = retry_after_ms_for(config, reason, rand::random::<f64>());
                (self.sink)(PolicyEvent::Admission(AdmissionEvent::Denied { reason, shadow: false, retry_after_ms }));
                AdmissionResult {
                    granted: false,
                    ticket_id: None,
                    shadow: false,
                    deny_reason: Some(reason),
                    retry_after_ms: Some(retry_after_ms),
                }
            }
        }
    }

    async fn acquire_enforced(&self, gates: &[GateSpec], now: DateTime<Utc>) -> Result<Vec<(String, u64)>, AdmissionDenyReason> {
        let mut acquired = Vec::new();
        for gate in gates {
            if !gate.enforce {
                continue;
            }
            match self.backend.check_and_incr(&gate.key, gate.by, gate.max, gate.ttl, now).await {
                Ok(outcome) if outcome.allowed => acquired.push((gate.key.clone(), gate.by)),
                Ok(_) => {
                    self.rollback(&acquired).await;
                    return Err(gate.reason);
                }
                Err(err) => {
                    tracing::warn!(error = %err, key = %gate.key, "admission backend unavailable");
                    self.rollback(&acquired).await;
                    (self.sink)(PolicyEvent::Admission(AdmissionEvent::BackendUnavailable { failed_closed: true }));
                    return Err(AdmissionDenyReason::RedisUnavailable);
                }
            }
        }
        Ok(acquired)
    }

    async fn evaluate_shadow(&self, gates: &[GateSpec], now: DateTime<Utc>) -> Option<AdmissionDenyReason> {
        for gate in gates {
            if !gate.enforce {
                continue;
            }
            match self.backend.peek(&gate.key, now).await {
                Ok(value) if value + gate.by > gate.max => return Some(gate.reason),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, key = %gate.key, "admission backend unavailable in shadow mode");
                    return Some(AdmissionDenyReason::RedisUnavailable);
                }
            }
        }
        None
    }

    async fn rollback(&self, acquired: &[(String, u64)]) {
        for (key, by) in acquired {
            if let Err(err) = self.backend.decr(key, *by).await {
                tracing::warn!(error = %err, key, "failed to roll back admission counter");
            }
        }
    }

    /// `releaseAdmission(ticketId)`: idempotent delete-then-decrement. The
    /// first caller to remove `ticket_id` from the map owns the decrement;
    /// every subsequent call (retry, double-release) sees it already gone
    /// and is a no-op.
    pub async fn release_admission(&self, ticket_id: Uuid) {
        let acquired = self.tickets.lock().unwrap().remove(&ticket_id);
        let Some(acquired) = acquired else {
            return;
        };
        self.rollback(&acquired).await;
        (self.sink)(PolicyEvent::Admission(AdmissionEvent::Released { ticket_id: ticket_id.to_string() }));
    }
}

/// `resolveAdmissionRetryAfterMs(config, rnd) = clamp(round(base * (1 + (2*rnd-1) * jitter)), 100, 60_000)`.
///
/// `rnd` is expected to be in `[0, 1)`; `rnd=0` yields `base*(1-jitter)`,
/// `rnd=0.5` yields `base`, `rnd` approaching `1` approaches
/// `base*(1+jitter)`.
pub fn resolve_admission_retry_after_ms(config: &AdmissionConfig, rnd: f64) -> u64 {
    let jitter_pct = config.retry_after_jitter_pct as f64 / 100.0;
    let base = config.retry_after_ms as f64;
    let factor = 1.0 + (2.0 * rnd - 1.0) * jitter_pct;
    let resolved = (base * factor).round();
    resolved.clamp(100.0, 60_000.0) as u64
}

/// Jittered retry-after for a `redis_unavailable` denial, fixed to
/// `[800, 1200]` ms regardless of the tunable admission retry-after config
/// — backend unavailability is a distinct failure mode from an ordinary
/// gate denial and always retries on the same short cadence.
fn resolve_redis_unavailable_retry_after_ms(rnd: f64) -> u64 {
    800 + (rnd.clamp(0.0, 1.0) * 400.0).round() as u64
}

fn retry_after_ms_for(config: &AdmissionConfig, reason: AdmissionDenyReason, rnd: f64) -> u64 {
    if reason == AdmissionDenyReason::RedisUnavailable {
        resolve_redis_unavailable_retry_after_ms(rnd)
    } else {
        resolve_admission_retry_after_ms(config, rnd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AdmissionConfig {
        AdmissionConfig {
            enabled: true,
            shadow_mode: false,
            redis_url: String::new(),
            redis_token: String::new(),
            key_prefix: "test:admission".to_string(),
            enforce_user_inflight: true,
            enforce_global_inflight: true,
            enforce_global_msg_rate: true,
            enforce_global_tool_rate: true,
            user_max_inflight: 2,
            global_max_inflight: 10,
            global_max_msg_per_sec: 100,
            global_max_tool_per_sec: 20,
            estimated_tool_calls_per_msg: 1,
            ticket_ttl_ms: 120_000,
            retry_after_ms: 1_000,
            retry_after_jitter_pct: 20,
            allowed_event_sample_pct: 5,
        }
    }

    #[test]
    fn retry_after_formula_matches_the_three_rnd_invariants() {
        let config = test_config();
        assert_eq!(resolve_admission_retry_after_ms(&config, 0.0), 800);
        assert_eq!(resolve_admission_retry_after_ms(&config, 0.5), 1_000);
        assert_eq!(resolve_admission_retry_after_ms(&config, 1.0), 1_200);
    }

    #[test]
    fn retry_after_formula_clamps_to_bounds() {
        let mut config = test_config();
        config.retry_after_ms = 60_000;
        config.retry_after_jitter_pct = 90;
        assert_eq!(resolve_admission_retry_after_ms(&config, 1.0), 60_000);

        config.retry_after_ms = 100;
        config.retry_after_jitter_pct = 90;
        assert_eq!(resolve_admission_retry_after_ms(&config, 0.0), 100);
    }

    #[tokio::test]
    async fn grants_admission_under_every_limit() {
        let control = AdmissionControl::in_memory();
        let config = test_config();
        let result = control.check_and_acquire_admission("user1", 1, &config, AdmissionMode::Enforce, Utc::now()).await;
        assert!(result.granted);
        assert!(result.ticket_id.is_some());
    }

    #[tokio::test]
    async fn denies_once_user_inflight_cap_is_reached() {
        let control = AdmissionControl::in_memory();
        let config = test_config();
        let now = Utc::now();

        let first = control.check_and_acquire_admission("user1", 1, &config, AdmissionMode::Enforce, now).await;
        let second = control.check_and_acquire_admission("user1", 1, &config, AdmissionMode::Enforce, now).await;
        assert!(first.granted && second.granted);

        let third = control.check_and_acquire_admission("user1", 1, &config, AdmissionMode::Enforce, now).await;
        assert!(!third.granted);
        assert_eq!(third.deny_reason, Some(AdmissionDenyReason::UserInflight));
    }

    #[tokio::test]
    async fn a_denied_gate_rolls_back_only_what_this_call_incremented() {
        let control = AdmissionControl::in_memory();
        let mut config = test_config();
        config.user_max_inflight = 1_000; // never trips
        config.global_max_msg_per_sec = 0; // trips on the very first global-msg-rate check
        let now = Utc::now();

        let result = control.check_and_acquire_admission("user1", 1, &config, AdmissionMode::Enforce, now).await;
        assert!(!result.granted);

        // user inflight and global inflight were incremented before the
        // denial; a second request for the same user must still see room.
        let second = control.check_and_acquire_admission("user1", 1, &config, AdmissionMode::Enforce, now).await;
        assert!(!second.granted, "the same gate still trips");
        // But the rollback means repeated denials never leak inflight slots.
    }

    #[tokio::test]
    async fn second_request_same_principal_denied_then_recovers_after_release() {
        let control = AdmissionControl::in_memory();
        let mut config = test_config();
        config.user_max_inflight = 1;
        let now = Utc::now();

        let first = control.check_and_acquire_admission("user1", 1, &config, AdmissionMode::Enforce, now).await;
        assert!(first.granted);
        let second = control.check_and_acquire_admission("user1", 1, &config, AdmissionMode::Enforce, now).await;
        assert!(!second.granted);

        control.release_admission(first.ticket_id.unwrap()).await;
        let third = control.check_and_acquire_admission("user1", 1, &config, AdmissionMode::Enforce, now).await;
        assert!(third.granted, "releasing the first ticket frees the user's inflight slot");
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let control = AdmissionControl::in_memory();
        let config = test_config();
        let now = Utc::now();
        let result = control.check_and_acquire_admission("user1", 1, &config, AdmissionMode::Enforce, now).await;
        let ticket = result.ticket_id.unwrap();
        control.release_admission(ticket).await;
        control.release_admission(ticket).await; // must not double-decrement or panic
    }

    #[tokio::test]
    async fn shadow_mode_always_grants_and_never_increments_counters() {
        let control = AdmissionControl::in_memory();
        let mut config = test_config();
        config.user_max_inflight = 1;
        let now = Utc::now();

        for _ in 0..5 {
            let result = control.check_and_acquire_admission("user1", 1, &config, AdmissionMode::Shadow, now).await;
            assert!(result.granted, "shadow mode never denies");
            assert!(result.shadow);
        }
    }

    #[tokio::test]
    async fn disabled_admission_grants_without_a_ticket() {
        let control = AdmissionControl::in_memory();
        let mut config = test_config();
        config.enabled = false;
        let result = control.check_and_acquire_admission("user1", 1, &config, AdmissionMode::Enforce, Utc::now()).await;
        assert!(result.granted);
        assert!(result.ticket_id.is_none());
    }

    struct FailingBackend;

    #[async_trait]
    impl AdmissionBackend for FailingBackend {
        async fn check_and_incr(&self, _key: &str, _by: u64, _max: u64, _ttl: Duration, _now: DateTime<Utc>) -> StoreResult<IncrOutcome> {
            Err(crate::store::StoreError::Unavailable("connection refused".to_string()))
        }

        async fn decr(&self, _key: &str, _by: u64) -> StoreResult<()> {
            Ok(())
        }

        async fn peek(&self, _key: &str, _now: DateTime<Utc>) -> StoreResult<u64> {
            Err(crate::store::StoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn enforce_mode_fails_closed_with_redis_unavailable_on_backend_error() {
        let control = AdmissionControl::new(Arc::new(FailingBackend), Arc::new(|_event| {}));
        let config = test_config();
        let result = control.check_and_acquire_admission("user1", 1, &config, AdmissionMode::Enforce, Utc::now()).await;
        assert!(!result.granted);
        assert_eq!(result.deny_reason, Some(AdmissionDenyReason::RedisUnavailable));
        let retry = result.retry_after_ms.unwrap();
        assert!((800..=1_200).contains(&retry), "redis_unavailable retry-after must land in [800,1200]ms, got {retry}");
    }

    #[tokio::test]
    async fn shadow_mode_reports_would_have_blocked_on_backend_error_but_still_grants() {
        let control = AdmissionControl::new(Arc::new(FailingBackend), Arc::new(|_event| {}));
        let config = test_config();
        let result = control.check_and_acquire_admission("user1", 1, &config, AdmissionMode::Shadow, Utc::now()).await;
        assert!(result.granted, "shadow mode never denies, even on backend error");
        assert!(result.shadow);
    }
}
