//! # 限流器性能基准测试

use criterion::{Criterion, criterion_group, criterion_main};
use relay_gateway::config::{RateLimitConfig, UserLimits};
use relay_gateway::ratelimit::{AdmissionRequest, RateLimiter};
use std::hint::black_box;
use std::time::Duration;
use tokio::runtime::Runtime;

/// 内存后端基准测试
pub fn limiter_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let limiter = RateLimiter::memory(RateLimitConfig::default());

    // 基准测试：滑动窗口（大量不同键）
    c.bench_function("sliding_window_distinct_keys", |b| {
        b.to_async(&rt).iter(|| async {
            let scope = format!("bench:{}", fastrand::u32(..10_000));
            limiter
                .allow_sliding_window(
                    black_box(&scope),
                    1_000,
                    Duration::from_secs(60),
                    Duration::from_secs(120),
                )
                .await
        });
    });

    // 基准测试：令牌桶（单个热点键）
    c.bench_function("token_bucket_hot_key", |b| {
        b.to_async(&rt).iter(|| async {
            limiter
                .allow_token_bucket(black_box("bench:bucket"), 1_000_000.0, 1_000_000.0, 1.0)
                .await
        });
    });

    // 基准测试：并发许可获取与释放
    c.bench_function("concurrency_acquire_release", |b| {
        b.to_async(&rt).iter(|| async {
            let (allowed, permit) = limiter.check_concurrency(black_box("bench:conc"), 64).await;
            permit.release().await;
            allowed
        });
    });

    // 基准测试：完整的用户准入
    let limited = RateLimiter::memory(RateLimitConfig {
        default_limits: UserLimits {
            concurrency: 1_000,
            rpm: i64::MAX / 2,
            tpm: i64::MAX / 2,
            rpd: i64::MAX / 2,
            tpd: i64::MAX / 2,
        },
        ..RateLimitConfig::default()
    });
    c.bench_function("user_admission", |b| {
        b.to_async(&rt).iter(|| async {
            let request = AdmissionRequest {
                request_id: "bench",
                user_id: fastrand::i64(1..1_000),
                group: "default",
                declared_tokens: 512,
            };
            if let Ok(admission) = limited.admit(black_box(&request)).await {
                limited.settle_admission(&admission, 400).await;
                admission.permit.release().await;
            }
        });
    });
}

criterion_group!(benches, limiter_benchmark);
criterion_main!(benches);
