//! Persistence abstractions for the gateway's stateful components.
//!
//! Each component that needs durable state defines a narrow trait here
//! rather than sharing one generic document store, mirroring how the
//! teacher crate kept `rate_limit::store::TokenStore` scoped to exactly the
//! operations a token bucket needs. Every trait ships an in-memory fake
//! good enough for tests and for running the gateway without Postgres; the
//! `sendcat-postgres` satellite crate provides the durable implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Errors returned by any `Store` implementation. Kept deliberately generic
/// (backend-agnostic) since callers only care "did it work" / "was there a
/// conflict" / "is the backend down".
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage backend returned malformed data: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// §3 `RateLimitWindow` row, keyed by `(bucket, subject)`.
///
/// `allowed` distinguishes "incremented, still under cap" from "denied,
/// left unchanged at cap" — both cases can report the same `count`.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitWindowRow {
    pub count: u64,
    pub allowed: bool,
    pub window_started_at: DateTime<Utc>,
}

/// §3 `RateLimitEvent`/`RateLimitAlert` row for `getEventSummary`/`monitorAndAlert`.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitEventRow {
    pub bucket: String,
    pub subject: String,
    pub throttled: bool,
    pub at: DateTime<Utc>,
}

/// Component B: fixed-window counters plus the rolling event log used for
/// alerting.
#[async_trait]
pub trait RateLimitStore: Send + Sync + 'static {
    /// Read-or-create the current window row for `(bucket, subject)`. If
    /// `count >= max`, return the row unmodified (the caller denies without
    /// writing — the key anti-contention optimization from §4.B). Otherwise
    /// increment and persist. Resets the window if it has expired.
    async fn check_and_increment(
        &self,
        bucket: &str,
        subject: &str,
        max: u64,
        window: std::time::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<RateLimitWindowRow>;

    async fn record_event(&self, event: RateLimitEventRow) -> StoreResult<()>;

    /// Events within `[since, now]` for a bucket, for `getEventSummary` and
    /// the 5-minute alert window.
    async fn events_since(
        &self,
        bucket: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<RateLimitEventRow>>;
}

/// Result of a `ReplayStore::claim` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplayClaimRow {
    /// `true` if `key` had already been claimed within its TTL.
    pub duplicate: bool,
    /// Number of times `key` has been claimed, including this call.
    pub hit_count: u64,
}

/// Component C: idempotency replay guard.
#[async_trait]
pub trait ReplayStore: Send + Sync + 'static {
    /// Attempt to claim `key`, resetting its counter once the TTL from the
    /// prior claim has elapsed.
    async fn claim(&self, key: &str, ttl: std::time::Duration, now: DateTime<Utc>) -> StoreResult<ReplayClaimRow>;
}

/// §3 `ToolResultCache` row.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntryRow {
    pub value: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

/// Component G/H supporting cache for idempotent tool/provider results.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    async fn get(&self, key: &str, now: DateTime<Utc>) -> StoreResult<Option<serde_json::Value>>;
    async fn put(&self, key: &str, value: serde_json::Value, ttl: std::time::Duration, now: DateTime<Utc>) -> StoreResult<()>;
}

/// §3 `ToolQueueAlert` / rate-limit alert row shipped to Sentry.
#[derive(Clone, Debug, PartialEq)]
pub struct AlertRow {
    pub kind: String,
    pub payload: serde_json::Value,
    pub fired_at: DateTime<Utc>,
}

/// Alert de-duplication / cooldown tracking (§4.B, §4.G — "don't re-fire the
/// same alert more than once per cooldown window").
#[async_trait]
pub trait AlertStore: Send + Sync + 'static {
    /// Returns `true` if `kind` may fire now (cooldown elapsed or never
    /// fired), recording the attempt either way.
    async fn try_fire(&self, kind: &str, cooldown: std::time::Duration, now: DateTime<Utc>) -> StoreResult<bool>;
    async fn record(&self, alert: AlertRow) -> StoreResult<()>;
}

/// In-memory `RateLimitStore` fake.
#[derive(Default)]
pub struct InMemoryRateLimitStore {
    windows: Mutex<HashMap<(String, String), RateLimitWindowRow>>,
    events: Mutex<Vec<RateLimitEventRow>>,
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn check_and_increment(
        &self,
        bucket: &str,
        subject: &str,
        max: u64,
        window: std::time::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<RateLimitWindowRow> {
        let mut windows = self.windows.lock().unwrap();
        let key = (bucket.to_string(), subject.to_string());
        let window_chrono = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());

        let entry = windows.entry(key).or_insert(RateLimitWindowRow { count: 0, allowed: true, window_started_at: now });
        if now - entry.window_started_at >= window_chrono {
            entry.count = 0;
            entry.window_started_at = now;
        }
        if entry.count >= max {
            entry.allowed = false;
            return Ok(entry.clone());
        }
        entry.count += 1;
        entry.allowed = true;
        Ok(entry.clone())
    }

    async fn record_event(&self, event: RateLimitEventRow) -> StoreResult<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn events_since(&self, bucket: &str, since: DateTime<Utc>) -> StoreResult<Vec<RateLimitEventRow>> {
        let events = self.events.lock().unwrap();
        Ok(events.iter().filter(|e| e.bucket == bucket && e.at >= since).cloned().collect())
    }
}

struct ReplayEntry {
    claimed_at: DateTime<Utc>,
    hit_count: u64,
}

/// In-memory `ReplayStore` fake.
#[derive(Default)]
pub struct InMemoryReplayStore {
    claims: Mutex<HashMap<String, ReplayEntry>>,
}

#[async_trait]
impl ReplayStore for InMemoryReplayStore {
    async fn claim(&self, key: &str, ttl: std::time::Duration, now: DateTime<Utc>) -> StoreResult<ReplayClaimRow> {
        let mut claims = self.claims.lock().unwrap();
        let ttl_chrono = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        match claims.get_mut(key) {
            Some(entry) if now - entry.claimed_at < ttl_chrono => {
                entry.hit_count += 1;
                Ok(ReplayClaimRow { duplicate: true, hit_count: entry.hit_count })
            }
            _ => {
                claims.insert(key.to_string(), ReplayEntry { claimed_at: now, hit_count: 1 });
                Ok(ReplayClaimRow { duplicate: false, hit_count: 1 })
            }
        }
    }
}

/// In-memory `CacheStore` fake.
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: Mutex<HashMap<String, CacheEntryRow>>,
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str, now: DateTime<Utc>) -> StoreResult<Option<serde_json::Value>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(row) if row.expires_at > now => Ok(Some(row.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: serde_json::Value, ttl: std::time::Duration, now: DateTime<Utc>) -> StoreResult<()> {
        let ttl_chrono = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        self.entries.lock().unwrap().insert(key.to_string(), CacheEntryRow { value, expires_at: now + ttl_chrono });
        Ok(())
    }
}

/// In-memory `AlertStore` fake.
#[derive(Default)]
pub struct InMemoryAlertStore {
    last_fired: Mutex<HashMap<String, DateTime<Utc>>>,
    records: Mutex<Vec<AlertRow>>,
}

#[async_trait]
impl AlertStore for InMemoryAlertStore {
    async fn try_fire(&self, kind: &str, cooldown: std::time::Duration, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut last_fired = self.last_fired.lock().unwrap();
        let cooldown_chrono = chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::zero());
        match last_fired.get(kind) {
            Some(last) if now - *last < cooldown_chrono => Ok(false),
            _ => {
                last_fired.insert(kind.to_string(), now);
                Ok(true)
            }
        }
    }

    async fn record(&self, alert: AlertRow) -> StoreResult<()> {
        self.records.lock().unwrap().push(alert);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn rate_limit_window_resets_after_expiry() {
        let store = InMemoryRateLimitStore::default();
        let t0 = Utc::now();
        let w1 = store.check_and_increment("chat_stream", "user1", 100, Duration::from_secs(60), t0).await.unwrap();
        assert_eq!(w1.count, 1);

        let w2 = store
            .check_and_increment("chat_stream", "user1", 100, Duration::from_secs(60), t0 + chrono::Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(w2.count, 2, "still inside the window");

        let w3 = store
            .check_and_increment("chat_stream", "user1", 100, Duration::from_secs(60), t0 + chrono::Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(w3.count, 1, "window elapsed, counter resets");
    }

    #[tokio::test]
    async fn rate_limit_window_stops_writing_once_at_max() {
        let store = InMemoryRateLimitStore::default();
        let t0 = Utc::now();
        for _ in 0..3 {
            store.check_and_increment("chat_stream", "user1", 3, Duration::from_secs(60), t0).await.unwrap();
        }
        let over = store.check_and_increment("chat_stream", "user1", 3, Duration::from_secs(60), t0).await.unwrap();
        assert_eq!(over.count, 3, "count must not climb past max once denied");
    }

    #[tokio::test]
    async fn replay_store_claims_once_within_ttl() {
        let store = InMemoryReplayStore::default();
        let t0 = Utc::now();
        assert!(!store.claim("key1", Duration::from_secs(60), t0).await.unwrap().duplicate);
        let dup = store.claim("key1", Duration::from_secs(60), t0 + chrono::Duration::seconds(10)).await.unwrap();
        assert!(dup.duplicate);
        assert_eq!(dup.hit_count, 2);
        assert!(!store.claim("key1", Duration::from_secs(60), t0 + chrono::Duration::seconds(61)).await.unwrap().duplicate);
    }

    #[tokio::test]
    async fn cache_store_expires_entries() {
        let store = InMemoryCacheStore::default();
        let t0 = Utc::now();
        store.put("k", serde_json::json!({"v": 1}), Duration::from_secs(10), t0).await.unwrap();
        assert!(store.get("k", t0 + chrono::Duration::seconds(5)).await.unwrap().is_some());
        assert!(store.get("k", t0 + chrono::Duration::seconds(11)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn alert_store_respects_cooldown() {
        let store = InMemoryAlertStore::default();
        let t0 = Utc::now();
        assert!(store.try_fire("queue_depth", Duration::from_secs(300), t0).await.unwrap());
        assert!(!store.try_fire("queue_depth", Duration::from_secs(300), t0 + chrono::Duration::seconds(60)).await.unwrap());
        assert!(store.try_fire("queue_depth", Duration::from_secs(300), t0 + chrono::Duration::seconds(301)).await.unwrap());
    }
}
