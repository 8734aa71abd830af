//! # 进程内限流后端
//!
//! 每个键一个 `DashMap` 条目，条目写锁内完成淘汰、比较和追加。
//! 并发计数使用原子变量的比较并交换。

use async_trait::async_trait;
use chrono::Local;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use super::backend::{BucketDecision, LimiterBackend, WindowMode};
use crate::error::Result;
use crate::types::seconds_until_local_midnight;

#[derive(Debug)]
struct WindowEntry {
    samples: VecDeque<(Instant, i64)>,
    total: i64,
    window: Duration,
    expires_at: Instant,
}

impl WindowEntry {
    fn new(window: Duration, now: Instant) -> Self {
        Self {
            samples: VecDeque::new(),
            total: 0,
            window,
            expires_at: now,
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(ts, count)) = self.samples.front() {
            if now.duration_since(ts) < self.window {
                break;
            }
            self.samples.pop_front();
            self.total -= count;
        }
    }
}

#[derive(Debug)]
struct DailyEntry {
    count: i64,
    expires_at: Instant,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

/// 内存限流后端
#[derive(Default)]
pub struct MemoryLimiter {
    concurrency: DashMap<String, Arc<AtomicI64>>,
    windows: DashMap<String, WindowEntry>,
    daily: DashMap<String, DailyEntry>,
    buckets: DashMap<String, BucketState>,
}

impl MemoryLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前并发计数
    #[must_use]
    pub fn in_flight(&self, key: &str) -> i64 {
        self.concurrency
            .get(key)
            .map_or(0, |counter| counter.load(Ordering::Acquire))
    }

    /// 跟踪的键总数
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.concurrency.len() + self.windows.len() + self.daily.len() + self.buckets.len()
    }

    fn counter(&self, key: &str) -> Arc<AtomicI64> {
        if let Some(counter) = self.concurrency.get(key) {
            return Arc::clone(counter.value());
        }
        Arc::clone(
            self.concurrency
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AtomicI64::new(0)))
                .value(),
        )
    }

    fn decrement(&self, key: &str) {
        if let Some(counter) = self.concurrency.get(key) {
            let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current > 0).then(|| current - 1)
            });
        }
    }
}

#[async_trait]
impl LimiterBackend for MemoryLimiter {
    async fn acquire_concurrency(&self, key: &str, limit: i64) -> Result<bool> {
        let counter = self.counter(key);
        let mut current = counter.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return Ok(false);
            }
            match counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(true),
                Err(actual) => current = actual,
            }
        }
    }

    async fn release_concurrency(&self, key: &str) -> Result<()> {
        self.decrement(key);
        Ok(())
    }

    fn release_concurrency_now(&self, key: &str) -> bool {
        self.decrement(key);
        true
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
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry::new(window, now));
        entry.window = window;
        entry.evict(now);

        if mode != WindowMode::Record && entry.total >= limit {
            return Ok(false);
        }
        if mode == WindowMode::Peek {
            return Ok(true);
        }

        entry.samples.push_back((now, count));
        entry.total += count;
        entry.expires_at = now + expiry.max(window);
        Ok(true)
    }

    async fn daily(&self, key: &str, limit: i64, count: i64, mode: WindowMode) -> Result<bool> {
        let now = Instant::now();
        let midnight = now + Duration::from_secs(seconds_until_local_midnight(Local::now()));
        let mut entry = self
            .daily
            .entry(key.to_string())
            .or_insert_with(|| DailyEntry {
                count: 0,
                expires_at: midnight,
            });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = midnight;
        }

        if mode != WindowMode::Record && entry.count >= limit {
            return Ok(false);
        }
        if mode == WindowMode::Peek {
            return Ok(true);
        }
        entry.count += count;
        Ok(true)
    }

    async fn token_bucket(
        &self,
        key: &str,
        capacity: f64,
        rate_per_sec: f64,
        cost: f64,
    ) -> Result<BucketDecision> {
        let now = Instant::now();
        let mut state = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketState {
                tokens: capacity,
                last: now,
            });

        let elapsed = now.duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * rate_per_sec).min(capacity);
        state.last = now;

        if state.tokens >= cost {
            state.tokens -= cost;
            return Ok(BucketDecision::allowed());
        }

        // 速率极小时等待时长会超出 Duration 的表示范围
        let retry_after = if rate_per_sec > 0.0 {
            Duration::try_from_secs_f64((cost - state.tokens) / rate_per_sec).unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        };
        Ok(BucketDecision {
            allowed: false,
            retry_after,
        })
    }

    async fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.tracked_keys();

        self.windows.retain(|_, entry| {
            entry.evict(now);
            !entry.samples.is_empty() && entry.expires_at > now
        });
        self.daily.retain(|_, entry| entry.expires_at > now);
        // 桶在补满之后与新建的桶没有区别
        self.buckets
            .retain(|_, state| now.duration_since(state.last) < Duration::from_secs(3_600));
        // 只有映射自身持有的计数器才能安全移除
        self.concurrency.retain(|_, counter| {
            counter.load(Ordering::Acquire) > 0 || Arc::strong_count(counter) > 1
        });

        before.saturating_sub(self.tracked_keys())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_concurrency_cas() {
        let limiter = MemoryLimiter::new();
        assert!(limiter.acquire_concurrency("u", 2).await.unwrap());
        assert!(limiter.acquire_concurrency("u", 2).await.unwrap());
        assert!(!limiter.acquire_concurrency("u", 2).await.unwrap());
        limiter.release_concurrency("u").await.unwrap();
        assert_eq!(limiter.in_flight("u"), 1);
        limiter.release_concurrency("u").await.unwrap();
        limiter.release_concurrency("u").await.unwrap();
        assert_eq!(limiter.in_flight("u"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_evicts_after_duration() {
        let limiter = MemoryLimiter::new();
        for _ in 0..3 {
            assert!(limiter
                .sliding_window("k", 3, MINUTE, MINUTE, 1, WindowMode::Allow)
                .await
                .unwrap());
        }
        assert!(!limiter
            .sliding_window("k", 3, MINUTE, MINUTE, 1, WindowMode::Allow)
            .await
            .unwrap());

        tokio::time::advance(MINUTE).await;
        assert!(limiter
            .sliding_window("k", 3, MINUTE, MINUTE, 1, WindowMode::Allow)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_peek_does_not_record() {
        let limiter = MemoryLimiter::new();
        for _ in 0..5 {
            assert!(limiter
                .sliding_window("k", 1, MINUTE, MINUTE, 1, WindowMode::Peek)
                .await
                .unwrap());
        }
        limiter
            .sliding_window("k", 1, MINUTE, MINUTE, 1, WindowMode::Record)
            .await
            .unwrap();
        assert!(!limiter
            .sliding_window("k", 1, MINUTE, MINUTE, 1, WindowMode::Peek)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_weighted_samples_compare_before_insert() {
        let limiter = MemoryLimiter::new();
        // 当前 0 < 100，允许一次追加 500
        assert!(limiter
            .sliding_window("tpm", 100, MINUTE, MINUTE, 500, WindowMode::Allow)
            .await
            .unwrap());
        assert!(!limiter
            .sliding_window("tpm", 100, MINUTE, MINUTE, 1, WindowMode::Allow)
            .await
            .unwrap());
        // 负值样本用于实际用量回补
        limiter
            .sliding_window("tpm", 100, MINUTE, MINUTE, -450, WindowMode::Record)
            .await
            .unwrap();
        assert!(limiter
            .sliding_window("tpm", 100, MINUTE, MINUTE, 1, WindowMode::Allow)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_daily_counter() {
        let limiter = MemoryLimiter::new();
        assert!(limiter.daily("d", 2, 1, WindowMode::Allow).await.unwrap());
        assert!(limiter.daily("d", 2, 1, WindowMode::Allow).await.unwrap());
        assert!(!limiter.daily("d", 2, 1, WindowMode::Allow).await.unwrap());
        assert!(!limiter.daily("d", 2, 0, WindowMode::Peek).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_refill() {
        let limiter = MemoryLimiter::new();
        for _ in 0..2 {
            assert!(limiter.token_bucket("b", 2.0, 1.0, 1.0).await.unwrap().allowed);
        }
        let denied = limiter.token_bucket("b", 2.0, 1.0, 1.0).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.token_bucket("b", 2.0, 1.0, 1.0).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_tiny_rate_saturates_retry_after() {
        let limiter = MemoryLimiter::new();
        assert!(limiter.token_bucket("slow", 1.0, 1e-20, 1.0).await.unwrap().allowed);
        let denied = limiter.token_bucket("slow", 1.0, 1e-20, 1.0).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_empty_keys() {
        let limiter = MemoryLimiter::new();
        limiter
            .sliding_window("k", 10, MINUTE, MINUTE * 2, 1, WindowMode::Allow)
            .await
            .unwrap();
        assert!(limiter.acquire_concurrency("c", 1).await.unwrap());
        limiter.release_concurrency("c").await.unwrap();

        tokio::time::advance(MINUTE * 3).await;
        let removed = limiter.sweep().await;
        assert_eq!(removed, 2);
        assert_eq!(limiter.tracked_keys(), 0);
    }
}
