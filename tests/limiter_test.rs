//! # 限流器并发与性质测试
//!
//! 内存后端的并发正确性；Redis 后端的同名用例需要本地 Redis，默认忽略。

use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use relay_gateway::cache::RedisClient;
use relay_gateway::config::{RateLimitConfig, RedisConfig};
use relay_gateway::ratelimit::{RateLimiter, RedisLimiter};

const WINDOW: Duration = Duration::from_secs(60);
const EXPIRY: Duration = Duration::from_secs(120);

fn memory_limiter() -> RateLimiter {
    RateLimiter::memory(RateLimitConfig::default())
}

async fn redis_limiter() -> RateLimiter {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string());
    let client = RedisClient::new(RedisConfig {
        url,
        key_prefix: format!("relay-test-{}", uuid::Uuid::new_v4().simple()),
        ..RedisConfig::default()
    })
    .await
    .unwrap();
    RateLimiter::new(Arc::new(RedisLimiter::new(client)), RateLimitConfig::default())
}

/// 并发调用滑动窗口，返回放行次数
async fn race_sliding_window(limiter: &RateLimiter, scope: &str, callers: usize, max: i64) -> usize {
    let mut handles = Vec::with_capacity(callers);
    for _ in 0..callers {
        let limiter = limiter.clone();
        let scope = scope.to_string();
        handles.push(tokio::spawn(async move {
            limiter.allow_sliding_window(&scope, max, WINDOW, EXPIRY).await
        }));
    }
    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    allowed
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_sliding_window_race_allows_exactly_max() {
    let limiter = memory_limiter();
    for run in 0..5 {
        let allowed = race_sliding_window(&limiter, &format!("race-{run}"), 1000, 10).await;
        assert_eq!(allowed, 10, "run {run}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrency_limit_holds_under_contention() {
    let limiter = memory_limiter();
    let barrier = Arc::new(tokio::sync::Barrier::new(100));
    let mut handles = Vec::new();
    for _ in 0..100 {
        let limiter = limiter.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            let (allowed, permit) = limiter.check_concurrency("user:2", 7).await;
            barrier.wait().await;
            permit.release().await;
            allowed
        }));
    }
    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    // 所有许可在屏障处同时持有，放行数恰好等于上限
    assert_eq!(allowed, 7);

    // 全部释放后重新可用
    let (again, permit) = limiter.check_concurrency("user:2", 7).await;
    assert!(again);
    permit.release().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rpm_burst_is_capped() {
    let limiter = memory_limiter();
    let mut handles = Vec::new();
    for _ in 0..300 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move { limiter.check_rpm("user:3", 50).await }));
    }
    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 50);
    assert!(limiter.peek_rpm("user:4", 50).await);
    assert!(!limiter.peek_rpm("user:3", 50).await);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// 突发请求中放行数等于 min(上限, 请求数)
    #[test]
    fn prop_sliding_window_admits_min_of_limit_and_calls(max in 1i64..40, calls in 1usize..120) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let allowed = runtime.block_on(async {
            race_sliding_window(&memory_limiter(), "prop", calls, max).await
        });
        prop_assert_eq!(allowed, calls.min(max as usize));
    }

    /// 令牌桶在没有补充的瞬间最多放行 floor(容量 / 消耗) 次
    #[test]
    fn prop_token_bucket_burst_bounded(capacity in 1u32..50, cost in 1u32..5) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let allowed = runtime.block_on(async {
            let limiter = memory_limiter();
            let mut allowed = 0u32;
            for _ in 0..(capacity * 2) {
                if limiter
                    .allow_token_bucket("bucket", f64::from(capacity), 0.000_001, f64::from(cost))
                    .await
                {
                    allowed += 1;
                }
            }
            allowed
        });
        prop_assert_eq!(allowed, capacity / cost);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "需要本地 Redis，设置 REDIS_URL 后运行"]
async fn test_redis_sliding_window_race_allows_exactly_max() {
    let limiter = redis_limiter().await;
    for run in 0..3 {
        let allowed = race_sliding_window(&limiter, &format!("race-{run}"), 1000, 10).await;
        assert_eq!(allowed, 10, "run {run}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "需要本地 Redis，设置 REDIS_URL 后运行"]
async fn test_redis_concurrency_release() {
    let limiter = redis_limiter().await;
    let (first, held) = limiter.check_concurrency("user:redis", 1).await;
    assert!(first);
    let (second, denied) = limiter.check_concurrency("user:redis", 1).await;
    assert!(!second);
    denied.release().await;
    held.release().await;
    let (third, permit) = limiter.check_concurrency("user:redis", 1).await;
    assert!(third);
    permit.release().await;
}
