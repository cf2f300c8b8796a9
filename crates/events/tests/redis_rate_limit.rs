//! Rate limit store tests against a real Redis server.
//!
//! Run with `REDIS_URL` set and `--ignored`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use deadpool_redis::redis;
use pitchey_events::rate_limit::{RedisRateLimitStore, SlidingOutcome};
use pitchey_events::RateLimitStore;

fn redis_url() -> String {
    std::env::var("REDIS_URL").expect("REDIS_URL must be set for Redis tests")
}

fn store() -> RedisRateLimitStore {
    RedisRateLimitStore::from_url(&redis_url()).unwrap()
}

/// A key no other test run uses.
fn fresh_key(name: &str) -> String {
    format!("test:ratelimit:{name}:{}", uuid::Uuid::new_v4())
}

async fn counter(key: &str) -> Option<i64> {
    let pool = deadpool_redis::Config::from_url(redis_url())
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .unwrap();
    let mut conn = pool.get().await.unwrap();
    redis::cmd("GET").arg(key).query_async(&mut conn).await.unwrap()
}

// ---------------------------------------------------------------------------
// Fixed windows
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore]
async fn fixed_window_denies_past_limit_and_rolls_back() {
    let store = store();
    let key = fresh_key("fixed");
    let ttl = Duration::from_secs(60);

    for _ in 0..3 {
        assert!(store.incr_fixed(&key, 3, ttl, Utc::now()).await.unwrap());
    }
    assert!(!store.incr_fixed(&key, 3, ttl, Utc::now()).await.unwrap());
    assert!(!store.incr_fixed(&key, 3, ttl, Utc::now()).await.unwrap());

    // Denied increments are undone.
    assert_eq!(counter(&key).await, Some(3));
}

#[tokio::test]
#[ignore]
async fn release_frees_one_slot_and_never_goes_negative() {
    let store = store();
    let key = fresh_key("release");
    let ttl = Duration::from_secs(60);

    assert!(store.incr_fixed(&key, 1, ttl, Utc::now()).await.unwrap());
    assert!(!store.incr_fixed(&key, 1, ttl, Utc::now()).await.unwrap());

    store.release_fixed(&key).await.unwrap();
    assert_eq!(counter(&key).await, Some(0));
    assert!(store.incr_fixed(&key, 1, ttl, Utc::now()).await.unwrap());

    store.release_fixed(&key).await.unwrap();
    store.release_fixed(&key).await.unwrap();
    assert_eq!(counter(&key).await, Some(0));

    let missing = fresh_key("release-missing");
    store.release_fixed(&missing).await.unwrap();
    assert_eq!(counter(&missing).await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn concurrent_increments_admit_exactly_the_limit() {
    let store = Arc::new(store());
    let key = fresh_key("concurrent");
    let ttl = Duration::from_secs(60);

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let store = Arc::clone(&store);
            let key = key.clone();
            tokio::spawn(async move { store.incr_fixed(&key, 10, ttl, Utc::now()).await.unwrap() })
        })
        .collect();

    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
    assert_eq!(counter(&key).await, Some(10));
}

// ---------------------------------------------------------------------------
// Sliding windows
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore]
async fn sliding_window_reports_oldest_entry_when_full() {
    let store = store();
    let key = fresh_key("sliding");
    let window = Duration::from_secs(60);
    let start = Utc::now();

    let first = store.record_sliding(&key, 2, window, start).await.unwrap();
    assert_eq!(first, SlidingOutcome::Admitted);
    let second = store
        .record_sliding(&key, 2, window, start + chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(second, SlidingOutcome::Admitted);

    let third = store
        .record_sliding(&key, 2, window, start + chrono::Duration::seconds(10))
        .await
        .unwrap();
    match third {
        SlidingOutcome::Rejected { oldest } => {
            assert_eq!(oldest.timestamp_millis(), start.timestamp_millis());
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    // Once the first entry leaves the window there is room again.
    let later = store
        .record_sliding(&key, 2, window, start + chrono::Duration::seconds(61))
        .await
        .unwrap();
    assert_eq!(later, SlidingOutcome::Admitted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn concurrent_sliding_records_admit_exactly_the_limit() {
    let store = Arc::new(store());
    let key = fresh_key("sliding-concurrent");
    let window = Duration::from_secs(60);
    let now = Utc::now();

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let store = Arc::clone(&store);
            let key = key.clone();
            tokio::spawn(async move { store.record_sliding(&key, 5, window, now).await.unwrap() })
        })
        .collect();

    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap() == SlidingOutcome::Admitted {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);
}

#[tokio::test]
#[ignore]
async fn health_check_pings_the_server() {
    let store = store();
    store.health_check().await.unwrap();
    assert_eq!(store.backend(), "redis");
}
