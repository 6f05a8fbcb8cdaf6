//! Exercised against a real Postgres instance; set `DATABASE_URL` and drop
//! `#[ignore]` locally. Not run in CI without that infrastructure.

use chrono::Utc;
use sendcat_core::{RateLimitStore, ReplayStore};
use sendcat_postgres::{connect_pool, run_migrations, PostgresRateLimitStore, PostgresReplayStore};
use std::time::Duration;

async fn pool() -> sqlx::PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for this test");
    let pool = connect_pool(&url).await.expect("connect");
    run_migrations(&pool).await.expect("migrate");
    pool
}

#[tokio::test]
#[ignore]
async fn rate_limit_window_increments_atomically_under_concurrency() {
    let pool = pool().await;
    let store = PostgresRateLimitStore::new(pool);
    let now = Utc::now();
    let bucket = format!("test_bucket_{}", uuid::Uuid::new_v4());

    let mut handles = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        let bucket = bucket.clone();
        handles.push(tokio::spawn(async move {
            store.check_and_increment(&bucket, "user1", 10, Duration::from_secs(60), now).await.unwrap()
        }));
    }

    let mut allowed_count = 0;
    for h in handles {
        if h.await.unwrap().allowed {
            allowed_count += 1;
        }
    }
    assert_eq!(allowed_count, 10, "exactly max requests should be admitted under a race");
}

#[tokio::test]
#[ignore]
async fn replay_claim_survives_process_restart() {
    let pool = pool().await;
    let store = PostgresReplayStore::new(pool);
    let now = Utc::now();
    let key = format!("test_key_{}", uuid::Uuid::new_v4());

    let first = store.claim(&key, Duration::from_secs(60), now).await.unwrap();
    assert!(!first.duplicate);

    let second = store.claim(&key, Duration::from_secs(60), now + chrono::Duration::seconds(5)).await.unwrap();
    assert!(second.duplicate);
}
