//! Postgres-backed durable stores for `sendcat-core`.
//!
//! Mirrors the narrow-trait-per-concern shape of `sendcat_core::store`: one
//! small wrapper type per trait, all sharing a single pool. Every write that
//! needs to be atomic across concurrent gateway instances (the rate-limit
//! window increment, the replay claim, the alert cooldown check) is a single
//! `INSERT ... ON CONFLICT ... DO UPDATE` statement rather than a
//! read-then-write round trip, so two replicas racing on the same key can't
//! both observe themselves as the winner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sendcat_core::{
    AlertRow, AlertStore, CacheEntryRow, CacheStore, RateLimitEventRow, RateLimitStore,
    RateLimitWindowRow, ReplayClaimRow, ReplayStore, StoreError, StoreResult,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

fn map_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Unavailable(e.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => StoreError::Corrupt(e.to_string()),
        _ => StoreError::Unavailable(e.to_string()),
    }
}

/// Open a connection pool against `database_url`.
pub async fn connect_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new().max_connections(10).connect(database_url).await
}

/// Run the embedded schema migrations. Idempotent; safe to call on every boot.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

#[derive(Clone)]
pub struct PostgresRateLimitStore {
    pool: PgPool,
}

impl PostgresRateLimitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitStore for PostgresRateLimitStore {
    async fn check_and_increment(
        &self,
        bucket: &str,
        subject: &str,
        max: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<RateLimitWindowRow> {
        let window_secs = window.as_secs_f64();
        let max = max as i64;
        let row = sqlx::query_as::<_, (i64, bool, DateTime<Utc>)>(
            r#"
            INSERT INTO rate_limit_windows (bucket, subject, count, allowed, window_started_at)
            VALUES ($1, $2, 1, TRUE, $3)
            ON CONFLICT (bucket, subject) DO UPDATE SET
                count = CASE
                    WHEN EXTRACT(EPOCH FROM ($3 - rate_limit_windows.window_started_at)) >= $4 THEN 1
                    WHEN rate_limit_windows.count >= $5 THEN rate_limit_windows.count
                    ELSE rate_limit_windows.count + 1
                END,
                allowed = CASE
                    WHEN EXTRACT(EPOCH FROM ($3 - rate_limit_windows.window_started_at)) >= $4 THEN TRUE
                    WHEN rate_limit_windows.count >= $5 THEN FALSE
                    ELSE TRUE
                END,
                window_started_at = CASE
                    WHEN EXTRACT(EPOCH FROM ($3 - rate_limit_windows.window_started_at)) >= $4 THEN $3
                    ELSE rate_limit_windows.window_started_at
                END
            RETURNING count, allowed, window_started_at
            "#,
        )
        .bind(bucket)
        .bind(subject)
        .bind(now)
        .bind(window_secs)
        .bind(max)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(RateLimitWindowRow { count: row.0 as u64, allowed: row.1, window_started_at: row.2 })
    }

    async fn record_event(&self, event: RateLimitEventRow) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO rate_limit_events (bucket, subject, throttled, at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&event.bucket)
        .bind(&event.subject)
        .bind(event.throttled)
        .bind(event.at)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn events_since(&self, bucket: &str, since: DateTime<Utc>) -> StoreResult<Vec<RateLimitEventRow>> {
        let rows = sqlx::query_as::<_, (String, String, bool, DateTime<Utc>)>(
            "SELECT bucket, subject, throttled, at FROM rate_limit_events WHERE bucket = $1 AND at >= $2",
        )
        .bind(bucket)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(rows
            .into_iter()
            .map(|(bucket, subject, throttled, at)| RateLimitEventRow { bucket, subject, throttled, at })
            .collect())
    }
}

#[derive(Clone)]
pub struct PostgresReplayStore {
    pool: PgPool,
}

impl PostgresReplayStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReplayStore for PostgresReplayStore {
    async fn claim(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> StoreResult<ReplayClaimRow> {
        let ttl_secs = ttl.as_secs_f64();
        let row = sqlx::query_as::<_, (bool, i64)>(
            r#"
            INSERT INTO replay_claims (key, claimed_at, hit_count)
            VALUES ($1, $2, 1)
            ON CONFLICT (key) DO UPDATE SET
                claimed_at = CASE
                    WHEN EXTRACT(EPOCH FROM ($2 - replay_claims.claimed_at)) >= $3 THEN $2
                    ELSE replay_claims.claimed_at
                END,
                hit_count = CASE
                    WHEN EXTRACT(EPOCH FROM ($2 - replay_claims.claimed_at)) >= $3 THEN 1
                    ELSE replay_claims.hit_count + 1
                END
            RETURNING
                (EXTRACT(EPOCH FROM ($2 - replay_claims.claimed_at)) < $3 AND replay_claims.hit_count > 1) AS duplicate,
                hit_count
            "#,
        )
        .bind(key)
        .bind(now)
        .bind(ttl_secs)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(ReplayClaimRow { duplicate: row.0, hit_count: row.1 as u64 })
    }
}

#[derive(Clone)]
pub struct PostgresCacheStore {
    pool: PgPool,
}

impl PostgresCacheStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheStore for PostgresCacheStore {
    async fn get(&self, key: &str, now: DateTime<Utc>) -> StoreResult<Option<serde_json::Value>> {
        let row = sqlx::query_as::<_, (serde_json::Value,)>(
            "SELECT value FROM cache_entries WHERE key = $1 AND expires_at > $2",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(row.map(|(value,)| value))
    }

    async fn put(&self, key: &str, value: serde_json::Value, ttl: Duration, now: DateTime<Utc>) -> StoreResult<()> {
        let ttl_chrono = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE SET value = $2, expires_at = $3
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now + ttl_chrono)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PostgresAlertStore {
    pool: PgPool,
}

impl PostgresAlertStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertStore for PostgresAlertStore {
    async fn try_fire(&self, kind: &str, cooldown: Duration, now: DateTime<Utc>) -> StoreResult<bool> {
        let cooldown_secs = cooldown.as_secs_f64();
        let row = sqlx::query_as::<_, (bool,)>(
            r#"
            INSERT INTO alert_cooldowns (kind, last_fired_at)
            VALUES ($1, $2)
            ON CONFLICT (kind) DO UPDATE SET
                last_fired_at = CASE
                    WHEN EXTRACT(EPOCH FROM ($2 - alert_cooldowns.last_fired_at)) >= $3 THEN $2
                    ELSE alert_cooldowns.last_fired_at
                END
            RETURNING (alert_cooldowns.last_fired_at = $2) AS fired
            "#,
        )
        .bind(kind)
        .bind(now)
        .bind(cooldown_secs)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(row.0)
    }

    async fn record(&self, alert: AlertRow) -> StoreResult<()> {
        sqlx::query("INSERT INTO alert_records (kind, payload, fired_at) VALUES ($1, $2, $3)")
            .bind(&alert.kind)
            .bind(&alert.payload)
            .bind(alert.fired_at)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }
}
