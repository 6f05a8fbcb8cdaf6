//! Component C: idempotency replay guard.
//!
//! A thin wrapper over `ReplayStore` that adds the fail-open policy: callers
//! (the HTTP surface, the tool-job queue) must never be blocked from
//! proceeding just because the replay store is unreachable. Losing
//! dedup coverage during a storage outage is preferable to losing
//! availability.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::store::ReplayStore;
use crate::telemetry::{PolicyEvent, ReplayEvent};

/// Outcome of `claim_key`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub duplicate: bool,
    pub hit_count: u64,
}

pub struct ReplayGuard {
    store: Arc<dyn ReplayStore>,
    sink: Arc<dyn Fn(PolicyEvent) + Send + Sync>,
}

impl ReplayGuard {
    pub fn new(store: Arc<dyn ReplayStore>, sink: Arc<dyn Fn(PolicyEvent) + Send + Sync>) -> Self {
        Self { store, sink }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(crate::store::InMemoryReplayStore::default()), Arc::new(|_event| {}))
    }

    /// `claimKey(scope, key, ttlMs)`.
    ///
    /// `scope` namespaces the key (e.g. `webhook`, `tool_result`) so the
    /// same raw key from two callers never collides. On a storage error the
    /// guard fails open: the claim is reported as fresh (not a duplicate) so
    /// the caller proceeds, and a `FailedOpen` event is emitted so operators
    /// can see dedup coverage degrading.
    pub async fn claim_key(&self, scope: &str, key: &str, ttl: Duration, now: DateTime<Utc>) -> ReplayOutcome {
        let namespaced = format!("{scope}:{key}");
        match self.store.claim(&namespaced, ttl, now).await {
            Ok(row) => {
                let event = if row.duplicate { ReplayEvent::Duplicate } else { ReplayEvent::Claimed };
                (self.sink)(PolicyEvent::Replay(event));
                ReplayOutcome { duplicate: row.duplicate, hit_count: row.hit_count }
            }
            Err(err) => {
                tracing::warn!(error = %err, scope, "replay store unavailable, failing open");
                (self.sink)(PolicyEvent::Replay(ReplayEvent::FailedOpen));
                ReplayOutcome { duplicate: false, hit_count: 1 }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_claim_is_not_a_duplicate() {
        let guard = ReplayGuard::in_memory();
        let outcome = guard.claim_key("webhook", "evt-1", Duration::from_secs(60), Utc::now()).await;
        assert!(!outcome.duplicate);
        assert_eq!(outcome.hit_count, 1);
    }

    #[tokio::test]
    async fn second_claim_within_ttl_is_a_duplicate() {
        let guard = ReplayGuard::in_memory();
        let now = Utc::now();
        guard.claim_key("webhook", "evt-1", Duration::from_secs(60), now).await;
        let second = guard.claim_key("webhook", "evt-1", Duration::from_secs(60), now).await;
        assert!(second.duplicate);
        assert_eq!(second.hit_count, 2);
    }

    #[tokio::test]
    async fn different_scopes_do_not_collide_on_the_same_raw_key() {
        let guard = ReplayGuard::in_memory();
        let now = Utc::now();
        let webhook = guard.claim_key("webhook", "shared-id", Duration::from_secs(60), now).await;
        let tool_result = guard.claim_key("tool_result", "shared-id", Duration::from_secs(60), now).await;
        assert!(!webhook.duplicate);
        assert!(!tool_result.duplicate);
    }

    #[tokio::test]
    async fn claim_expires_after_ttl() {
        let guard = ReplayGuard::in_memory();
        let now = Utc::now();
        guard.claim_key("webhook", "evt-1", Duration::from_secs(10), now).await;
        let after_ttl = guard.claim_key("webhook", "evt-1", Duration::from_secs(10), now + chrono::Duration::seconds(11)).await;
        assert!(!after_ttl.duplicate);
    }

    struct AlwaysFailsReplayStore;

    #[async_trait::async_trait]
    impl crate::store::ReplayStore for AlwaysFailsReplayStore {
        async fn claim(&self, _key: &str, _ttl: Duration, _now: DateTime<Utc>) -> crate::store::StoreResult<crate::store::ReplayClaimRow> {
            Err(crate::store::StoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn fails_open_when_store_is_unavailable() {
        let guard = ReplayGuard::new(Arc::new(AlwaysFailsReplayStore), Arc::new(|_event| {}));
        let outcome = guard.claim_key("webhook", "evt-1", Duration::from_secs(60), Utc::now()).await;
        assert!(!outcome.duplicate, "a failed store must never block the caller");
    }
}
