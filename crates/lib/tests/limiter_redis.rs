//! Integration tests against a live Redis. Run with:
//! `HERALD_TEST_REDIS_URL=redis://127.0.0.1/ cargo test -p herald --test limiter_redis -- --ignored`

use herald::limiter::{ManualClock, RedisWindowStore, SlidingWindowLimiter};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn redis_url() -> String {
    std::env::var("HERALD_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
}

fn unique_key(name: &str) -> String {
    format!("herald:test:{}:{}", name, uuid::Uuid::new_v4().simple())
}

async fn limiter(clock: Arc<ManualClock>) -> SlidingWindowLimiter {
    let store = RedisWindowStore::connect(&redis_url())
        .await
        .expect("connect to redis");
    SlidingWindowLimiter::new(Arc::new(store), clock)
}

#[tokio::test]
#[ignore = "needs a running redis"]
async fn redis_window_admits_limit_then_rejects() {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let limiter = limiter(clock.clone()).await;
    let key = unique_key("burst");
    let ct = CancellationToken::new();
    let window = Duration::from_secs(60);

    let mut over = Vec::new();
    for _ in 0..4 {
        over.push(limiter.check_and_increment(&key, 3, window, &ct).await);
    }
    assert_eq!(over, vec![false, false, false, true]);

    clock.advance(Duration::from_secs(61));
    assert!(!limiter.check_and_increment(&key, 3, window, &ct).await);
}

#[tokio::test]
#[ignore = "needs a running redis"]
async fn redis_check_only_never_records() {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let limiter = limiter(clock).await;
    let key = unique_key("check");
    let ct = CancellationToken::new();
    let window = Duration::from_secs(60);

    for _ in 0..5 {
        assert!(!limiter.check_only(&key, 1, window, &ct).await);
    }
    limiter.increment_only(&key, window, &ct).await;
    assert!(limiter.check_only(&key, 1, window, &ct).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "needs a running redis"]
async fn redis_concurrent_callers_share_one_window() {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let limiter = Arc::new(limiter(clock).await);
    let key = unique_key("race");

    let mut handles = Vec::new();
    for _ in 0..40 {
        let limiter = limiter.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            limiter
                .check_and_increment(&key, 7, Duration::from_secs(60), &CancellationToken::new())
                .await
        }));
    }
    let mut admitted = 0;
    for h in handles {
        if !h.await.expect("join") {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 7);
}
