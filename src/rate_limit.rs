//! Component B: fixed-window rate limiting with best-effort alerting.
//!
//! `RateLimiter::check_and_increment` is the hot path and is optimized to
//! avoid writing on the common "already over cap" case: it reads the
//! current window first and only persists an increment when the caller is
//! actually going to be admitted. A detected write conflict is treated as a
//! fail-closed contention fallback rather than retried, matching the
//! throttle-first posture the gateway takes everywhere else under load.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::alerting::{ship_best_effort, AlertShipper, NullShipper};
use crate::config::RateLimitBucketConfig;
use crate::store::{AlertStore, RateLimitEventRow, RateLimitStore};
use crate::telemetry::{PolicyEvent, RateLimitEvent};

/// Outcome of `check_and_increment`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_ms: u64,
}

/// The fixed retry hint returned on a detected storage write conflict
/// (§4.B: fail closed rather than retry inline under contention).
const CONTENTION_RETRY_AFTER_MS: u64 = 1_000;

/// Per-bucket threshold evaluated by `monitor_and_alert`.
#[derive(Clone, Copy, Debug)]
pub struct AlertThreshold {
    pub throttle_rate_pct: u64,
    pub cooldown: Duration,
}

pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    alerts: Arc<dyn AlertStore>,
    shipper: Arc<dyn AlertShipper>,
    sink: Arc<dyn Fn(PolicyEvent) + Send + Sync>,
    /// Process-local 5-second dedupe window, keyed by the same hash
    /// `record_event` already derives from `(bucket, key, outcome, reason,
    /// floor(now/5s))`. Necessarily best-effort across replicas, same as
    /// the bulkhead's Sentry cooldown map.
    dedupe_slots: Mutex<HashMap<u64, DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        alerts: Arc<dyn AlertStore>,
        shipper: Arc<dyn AlertShipper>,
        sink: Arc<dyn Fn(PolicyEvent) + Send + Sync>,
    ) -> Self {
        Self { store, alerts, shipper, sink, dedupe_slots: Mutex::new(HashMap::new()) }
    }

    /// Build a limiter backed by in-memory fakes and a null event sink, for
    /// tests and for running without external storage.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(crate::store::InMemoryRateLimitStore::default()),
            Arc::new(crate::store::InMemoryAlertStore::default()),
            Arc::new(NullShipper::new()),
            Arc::new(|_event| {}),
        )
    }

    /// `checkAndIncrement(bucket, key, max, windowMs)`.
    ///
    /// Denies without writing once `count >= max`. On a storage error, fails
    /// closed with the fixed `CONTENTION_RETRY_AFTER_MS` hint rather than
    /// retrying — the caller is expected to surface a 429 either way.
    pub async fn check_and_increment(
        &self,
        bucket: &str,
        key: &str,
        config: &RateLimitBucketConfig,
        now: DateTime<Utc>,
    ) -> RateLimitOutcome {
        let window = Duration::from_millis(config.window_ms);
        match self.store.check_and_increment(bucket, key, config.max, window, now).await {
            Ok(row) if row.allowed => {
                let outcome = RateLimitOutcome {
                    allowed: true,
                    remaining: config.max.saturating_sub(row.count),
                    retry_after_ms: 0,
                };
                self.record_event(bucket, key, false, None, now).await;
                (self.sink)(PolicyEvent::RateLimit(RateLimitEvent::Allowed {
                    bucket: bucket.to_string(),
                    count: row.count,
                    limit: config.max,
                }));
                outcome
            }
            Ok(row) => {
                let retry_after_ms = window.as_millis() as u64;
                self.record_event(bucket, key, true, Some("over_cap"), now).await;
                (self.sink)(PolicyEvent::RateLimit(RateLimitEvent::Throttled {
                    bucket: bucket.to_string(),
                    count: row.count,
                    limit: config.max,
                    retry_after_ms,
                }));
                RateLimitOutcome { allowed: false, remaining: 0, retry_after_ms }
            }
            Err(_) => {
                // Storage unavailable. Fail closed — a rate limiter that
                // can't see its own counters must not silently allow
                // unbounded traffic through.
                self.record_event(bucket, key, true, Some("store_unavailable"), now).await;
                RateLimitOutcome { allowed: false, remaining: 0, retry_after_ms: CONTENTION_RETRY_AFTER_MS }
            }
        }
    }

    /// `recordEvent`: writes an event row deduplicated within a 5-second
    /// bucket keyed by `(source, bucket, key, outcome, reason, floor(now/5s))`.
    /// Best-effort: a storage failure here is logged, never propagated.
    async fn record_event(&self, bucket: &str, key: &str, throttled: bool, reason: Option<&str>, now: DateTime<Utc>) {
        let dedupe_slot = now.timestamp() / 5;
        let mut hasher = DefaultHasher::new();
        ("rate_limit", bucket, key, throttled, reason, dedupe_slot).hash(&mut hasher);
        let dedupe_key = hasher.finish();

        // The in-memory/real stores don't natively dedupe; a lightweight
        // local guard keeps the 5s window's duplicate suppression cheap
        // without round-tripping to storage for a read first.
        if !self.claim_dedupe_slot(dedupe_key, now) {
            return;
        }

        if let Err(err) = self
            .store
            .record_event(RateLimitEventRow { bucket: bucket.to_string(), subject: key.to_string(), throttled, at: now })
            .await
        {
            tracing::warn!(error = %err, bucket, "failed to record rate-limit event");
        }
    }

    /// Claims `dedupe_key` for a fresh 5-second window. Returns `false` if
    /// this key was already claimed and hasn't expired yet.
    fn claim_dedupe_slot(&self, dedupe_key: u64, now: DateTime<Utc>) -> bool {
        let mut slots = self.dedupe_slots.lock().unwrap();
        slots.retain(|_, expires_at| *expires_at > now);
        match slots.entry(dedupe_key) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(now + chrono::Duration::seconds(5));
                true
            }
        }
    }

    /// `getEventSummary(windowMin)`: counts by `bucket:outcome` and
    /// `bucket:outcome:reason` over the trailing window.
    pub async fn event_summary(&self, bucket: &str, window: Duration, now: DateTime<Utc>) -> EventSummary {
        let since = now - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        let events = self.store.events_since(bucket, since).await.unwrap_or_default();
        let allowed = events.iter().filter(|e| !e.throttled).count() as u64;
        let throttled = events.iter().filter(|e| e.throttled).count() as u64;
        EventSummary { bucket: bucket.to_string(), allowed, throttled }
    }

    /// `monitorAndAlert`: evaluate `threshold` for `bucket` over the last 5
    /// minutes; if the throttle rate exceeds it, fire a cooldown-deduped
    /// alert and best-effort ship a warning envelope.
    pub async fn monitor_and_alert(&self, bucket: &str, threshold: &AlertThreshold, now: DateTime<Utc>) {
        let summary = self.event_summary(bucket, Duration::from_secs(300), now).await;
        let total = summary.allowed + summary.throttled;
        if total == 0 {
            return;
        }
        let throttle_rate_pct = (summary.throttled * 100) / total;
        if throttle_rate_pct < threshold.throttle_rate_pct {
            return;
        }

        let alert_key = format!("rate_limit:{bucket}");
        match self.alerts.try_fire(&alert_key, threshold.cooldown, now).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                tracing::warn!(error = %err, bucket, "alert store unavailable, skipping dedupe");
            }
        }

        (self.sink)(PolicyEvent::RateLimit(RateLimitEvent::Alert {
            bucket: bucket.to_string(),
            throttled_count: summary.throttled,
            window_minutes: 5,
        }));

        let payload = serde_json::json!({
            "message": format!("rate limit bucket {bucket} throttling {throttle_rate_pct}% of requests"),
            "level": "warning",
            "extra": { "bucket": bucket, "throttle_rate_pct": throttle_rate_pct, "sample_total": total },
        });
        ship_best_effort(self.shipper.as_ref(), Uuid::new_v4(), now, &payload).await;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventSummary {
    pub bucket: String,
    pub allowed: u64,
    pub throttled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryAlertStore, InMemoryRateLimitStore};
    use std::sync::Mutex;

    fn bucket_config(max: u64, window_ms: u64) -> RateLimitBucketConfig {
        RateLimitBucketConfig { max, window_ms }
    }

    #[tokio::test]
    async fn allows_up_to_max_then_denies_without_advancing_remaining() {
        let limiter = RateLimiter::in_memory();
        let config = bucket_config(2, 60_000);
        let now = Utc::now();

        let first = limiter.check_and_increment("chat_stream", "user1", &config, now).await;
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        let second = limiter.check_and_increment("chat_stream", "user1", &config, now).await;
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        let third = limiter.check_and_increment("chat_stream", "user1", &config, now).await;
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert_eq!(third.retry_after_ms, 60_000);
    }

    #[tokio::test]
    async fn window_resets_after_elapsing() {
        let limiter = RateLimiter::in_memory();
        let config = bucket_config(1, 1_000);
        let now = Utc::now();

        assert!(limiter.check_and_increment("chat_stream", "user1", &config, now).await.allowed);
        assert!(!limiter.check_and_increment("chat_stream", "user1", &config, now).await.allowed);

        let later = now + chrono::Duration::milliseconds(1_001);
        assert!(limiter.check_and_increment("chat_stream", "user1", &config, later).await.allowed);
    }

    #[tokio::test]
    async fn event_summary_counts_allowed_and_throttled() {
        let limiter = RateLimiter::in_memory();
        let config = bucket_config(1, 60_000);
        let now = Utc::now();

        limiter.check_and_increment("chat_stream", "user1", &config, now).await;
        limiter.check_and_increment("chat_stream", "user1", &config, now).await;

        let summary = limiter.event_summary("chat_stream", Duration::from_secs(300), now).await;
        assert_eq!(summary.allowed, 1);
        assert_eq!(summary.throttled, 1);
    }

    #[tokio::test]
    async fn monitor_and_alert_fires_once_per_cooldown() {
        let store: Arc<dyn RateLimitStore> = Arc::new(InMemoryRateLimitStore::default());
        let alerts: Arc<dyn AlertStore> = Arc::new(InMemoryAlertStore::default());
        let shipper = Arc::new(NullShipper::new());
        let fired = Arc::new(Mutex::new(0u32));
        let fired_clone = fired.clone();
        let limiter = RateLimiter::new(
            store.clone(),
            alerts,
            shipper.clone(),
            Arc::new(move |event| {
                if matches!(event, PolicyEvent::RateLimit(RateLimitEvent::Alert { .. })) {
                    *fired_clone.lock().unwrap() += 1;
                }
            }),
        );

        let config = bucket_config(1, 60_000);
        let now = Utc::now();
        limiter.check_and_increment("chat_stream", "user1", &config, now).await;
        limiter.check_and_increment("chat_stream", "user2", &config, now).await;

        let threshold = AlertThreshold { throttle_rate_pct: 10, cooldown: Duration::from_secs(300) };
        limiter.monitor_and_alert("chat_stream", &threshold, now).await;
        limiter.monitor_and_alert("chat_stream", &threshold, now + chrono::Duration::seconds(30)).await;

        assert_eq!(*fired.lock().unwrap(), 1, "second call within cooldown must not re-fire");
        assert_eq!(shipper.sent().len(), 1);
    }

    #[tokio::test]
    async fn record_event_dedupes_identical_events_within_5s_window() {
        let store: Arc<dyn RateLimitStore> = Arc::new(InMemoryRateLimitStore::default());
        let limiter = RateLimiter::new(store.clone(), Arc::new(InMemoryAlertStore::default()), Arc::new(NullShipper::new()), Arc::new(|_event| {}));
        let config = bucket_config(100, 60_000);
        let now = Utc::now();

        limiter.check_and_increment("chat_stream", "user1", &config, now).await;
        limiter.check_and_increment("chat_stream", "user1", &config, now + chrono::Duration::seconds(2)).await;
        let summary = limiter.event_summary("chat_stream", Duration::from_secs(300), now).await;
        assert_eq!(summary.allowed, 1, "the second allowed event inside the same 5s slot must be deduped");

        limiter.check_and_increment("chat_stream", "user1", &config, now + chrono::Duration::seconds(6)).await;
        let summary = limiter.event_summary("chat_stream", Duration::from_secs(300), now).await;
        assert_eq!(summary.allowed, 2, "a new 5s slot must record again");
    }

    #[tokio::test]
    async fn monitor_and_alert_skips_below_threshold() {
        let limiter = RateLimiter::in_memory();
        let config = bucket_config(100, 60_000);
        let now = Utc::now();
        limiter.check_and_increment("chat_stream", "user1", &config, now).await;

        let threshold = AlertThreshold { throttle_rate_pct: 10, cooldown: Duration::from_secs(300) };
        // Should not panic and should simply not fire; nothing to assert on
        // directly since the sink is a no-op in `in_memory()`.
        limiter.monitor_and_alert("chat_stream", &threshold, now).await;
    }
}
