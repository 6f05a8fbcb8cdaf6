//! Redis-backed `AdmissionBackend`, the production counter store for
//! component F. Counters are plain `INCRBY`/`EXPIRE` keys so every gateway
//! instance enforces against the same shared state.

#![cfg(feature = "redis-backend")]

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;

use crate::store::{StoreError, StoreResult};

use super::{AdmissionBackend, IncrOutcome};

pub struct RedisAdmissionBackend {
    manager: redis::aio::ConnectionManager,
}

impl RedisAdmissionBackend {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl AdmissionBackend for RedisAdmissionBackend {
    async fn check_and_incr(&self, key: &str, by: u64, max: u64, ttl: Duration, _now: DateTime<Utc>) -> StoreResult<IncrOutcome> {
        let mut conn = self.manager.clone();
        let ttl_secs = ttl.as_secs().max(1) as i64;

        // Lua keeps the check-then-increment atomic across the round trip:
        // a naive GET, compare, INCRBY from the client would race. Returns
        // `{allowed, value}`: `value` is the post-increment count when
        // allowed, or the unchanged current count when denied.
        let script = redis::Script::new(
            r"
            local current = tonumber(redis.call('GET', KEYS[1]) or '0')
            local by = tonumber(ARGV[1])
            local max = tonumber(ARGV[2])
            if current + by > max then
                return {0, current}
            end
            local new_value = redis.call('INCRBY', KEYS[1], by)
            redis.call('EXPIRE', KEYS[1], ARGV[3])
            return {1, new_value}
            ",
        );

        let (allowed, value): (i64, i64) = script
            .key(key)
            .arg(by)
            .arg(max)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(IncrOutcome { value: value.max(0) as u64, allowed: allowed != 0 })
    }

    async fn decr(&self, key: &str, by: u64) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        // `safeDecrement`: clamp at zero via Lua rather than risk INCRBY
        // driving the counter negative under concurrent release/rollback.
        let script = redis::Script::new(
            r"
            local current = tonumber(redis.call('GET', KEYS[1]) or '0')
            local by = tonumber(ARGV[1])
            local next_value = current - by
            if next_value < 0 then next_value = 0 end
            redis.call('SET', KEYS[1], next_value, 'KEEPTTL')
            return next_value
            ",
        );
        let _: i64 = script.key(key).arg(by).invoke_async(&mut conn).await.map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn peek(&self, key: &str, _now: DateTime<Utc>) -> StoreResult<u64> {
        let mut conn = self.manager.clone();
        let value: Option<i64> = conn.get(key).await.map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(value.unwrap_or(0).max(0) as u64)
    }
}
