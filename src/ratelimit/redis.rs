//! # Redis 限流后端
//!
//! 每种限流对应一个 Lua 脚本，保证多实例之间的原子性。

use async_trait::async_trait;
use chrono::Local;
use std::time::Duration;

use super::backend::{BucketDecision, LimiterBackend, WindowMode};
use super::scripts;
use crate::cache::RedisClient;
use crate::error::Result;
use crate::types::next_local_midnight_timestamp;

/// 并发计数键的兜底过期时间
const CONCURRENCY_TTL_SECS: u64 = 3_600;

/// 令牌桶键的最长过期时间（毫秒）
const MAX_BUCKET_TTL_MS: u64 = 86_400_000;

/// 桶从空补满所需时间的两倍作为键的过期时间，最长一天
fn bucket_ttl_ms(capacity: f64, rate_per_sec: f64) -> u64 {
    if rate_per_sec > 0.0 {
        ((capacity / rate_per_sec) * 2_000.0)
            .ceil()
            .clamp(1_000.0, MAX_BUCKET_TTL_MS as f64) as u64
    } else {
        3_600_000
    }
}

/// Redis 限流后端
#[derive(Clone)]
pub struct RedisLimiter {
    client: RedisClient,
}

impl RedisLimiter {
    #[must_use]
    pub const fn new(client: RedisClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LimiterBackend for RedisLimiter {
    async fn acquire_concurrency(&self, key: &str, limit: i64) -> Result<bool> {
        let allowed: i64 = self
            .client
            .eval_script(
                &scripts::CONCURRENCY_ACQUIRE,
                &[key.to_string()],
                &[limit.to_string(), CONCURRENCY_TTL_SECS.to_string()],
            )
            .await?;
        Ok(allowed == 1)
    }

    async fn release_concurrency(&self, key: &str) -> Result<()> {
        let _: i64 = self
            .client
            .eval_script(&scripts::CONCURRENCY_RELEASE, &[key.to_string()], &[] as &[String])
            .await?;
        Ok(())
    }

    async fn sliding_window(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
        expiry: Duration,
        count: i64,
        mode: WindowMode,
    ) -> Result<bool> {
        let expiry_secs = expiry.max(window).as_secs().max(1);
        let allowed: i64 = self
            .client
            .eval_script(
                &scripts::SLIDING_WINDOW,
                &[key.to_string()],
                &[
                    limit.to_string(),
                    window.as_millis().to_string(),
                    expiry_secs.to_string(),
                    count.to_string(),
                    uuid::Uuid::new_v4().simple().to_string(),
                    mode.as_str().to_string(),
                ],
            )
            .await?;
        Ok(allowed == 1)
    }

    async fn daily(&self, key: &str, limit: i64, count: i64, mode: WindowMode) -> Result<bool> {
        let expire_at = next_local_midnight_timestamp(Local::now());
        let allowed: i64 = self
            .client
            .eval_script(
                &scripts::DAILY,
                &[key.to_string()],
                &[
                    limit.to_string(),
                    count.to_string(),
                    expire_at.to_string(),
                    mode.as_str().to_string(),
                ],
            )
            .await?;
        Ok(allowed == 1)
    }

    async fn token_bucket(
        &self,
        key: &str,
        capacity: f64,
        rate_per_sec: f64,
        cost: f64,
    ) -> Result<BucketDecision> {
        let ttl_ms = bucket_ttl_ms(capacity, rate_per_sec);
        let (allowed, wait_ms): (i64, i64) = self
            .client
            .eval_script(
                &scripts::TOKEN_BUCKET,
                &[key.to_string()],
                &[
                    capacity.to_string(),
                    rate_per_sec.to_string(),
                    cost.to_string(),
                    ttl_ms.to_string(),
                ],
            )
            .await?;

        if allowed == 1 {
            return Ok(BucketDecision::allowed());
        }
        let retry_after = u64::try_from(wait_ms).map_or(Duration::MAX, Duration::from_millis);
        Ok(BucketDecision {
            allowed: false,
            retry_after,
        })
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_ttl_is_bounded() {
        assert_eq!(bucket_ttl_ms(10.0, 1.0), 20_000);
        assert_eq!(bucket_ttl_ms(1.0, 100.0), 1_000);
        assert_eq!(bucket_ttl_ms(1.0, 1e-20), MAX_BUCKET_TTL_MS);
        assert_eq!(bucket_ttl_ms(1.0, 0.0), 3_600_000);
    }
}
