//! # 缓存保活
//!
//! 长时间运行的异步流程在缓存中保存状态键，由本模块在键到期前续期。
//! 续期落在到期前的窗口内，间隔随机化以错开集中访问。
//! 键不存在（流程已结束）、超过最长存活时间或累计错误过多时停止跟踪。

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::cache::CacheBackend;
use crate::config::KeepAliveConfig;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lwarn};

#[derive(Debug, Clone, Copy)]
struct Entry {
    expiry: Duration,
    added_at: Instant,
    next_touch: Instant,
    errors: u32,
}

/// 一轮保活的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepAliveRound {
    pub touched: usize,
    pub dropped: usize,
}

/// 下次续期前的等待时长
///
/// 过期时间长于窗口时，续期落在到期前 `window - interval` 处；否则在一半过期时间内续期。
#[must_use]
pub fn next_touch_delay(expiry: Duration, window: Duration, interval: Duration) -> Duration {
    if expiry > window {
        expiry - window + interval.min(window / 2)
    } else {
        interval.min(expiry / 2)
    }
}

/// 保活管理器
pub struct KeepAliveManager {
    backend: Arc<dyn CacheBackend>,
    config: KeepAliveConfig,
    entries: DashMap<String, Entry>,
}

impl KeepAliveManager {
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>, config: KeepAliveConfig) -> Self {
        Self {
            backend,
            config,
            entries: DashMap::new(),
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.refresh_window_secs)
    }

    fn random_interval(&self) -> Duration {
        let min = self.config.min_interval_secs;
        let max = self.config.max_interval_secs.max(min);
        Duration::from_secs(fastrand::u64(min..=max))
    }

    /// 开始跟踪一个键；重复添加会重置计时
    pub fn add_key(&self, key: impl Into<String>, expiry: Duration) {
        let now = Instant::now();
        let delay = next_touch_delay(expiry, self.window(), self.random_interval());
        self.entries.insert(
            key.into(),
            Entry {
                expiry,
                added_at: now,
                next_touch: now + delay,
                errors: 0,
            },
        );
    }

    pub fn remove_key(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 续期所有到点的键
    pub async fn run_once(&self, now: Instant) -> KeepAliveRound {
        let max_lifetime = Duration::from_secs(self.config.max_lifetime_secs);
        let due: Vec<(String, Entry)> = self
            .entries
            .iter()
            .filter(|e| e.next_touch <= now || now.duration_since(e.added_at) >= max_lifetime)
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        let mut round = KeepAliveRound::default();
        for (key, entry) in due {
            if now.duration_since(entry.added_at) >= max_lifetime {
                self.entries.remove(&key);
                round.dropped += 1;
                ldebug!(
                    "system",
                    LogStage::BackgroundTask,
                    LogComponent::KeepAlive,
                    "max_lifetime",
                    "保活键超过最长存活时间",
                    key = %key
                );
                continue;
            }

            match self.backend.expire(&key, entry.expiry).await {
                Ok(true) => {
                    let delay = next_touch_delay(entry.expiry, self.window(), self.random_interval());
                    if let Some(mut tracked) = self.entries.get_mut(&key) {
                        tracked.next_touch = now + delay;
                        tracked.errors = 0;
                    }
                    round.touched += 1;
                }
                Ok(false) => {
                    self.entries.remove(&key);
                    round.dropped += 1;
                }
                Err(e) => {
                    let errors = entry.errors + 1;
                    if errors >= self.config.max_errors {
                        self.entries.remove(&key);
                        round.dropped += 1;
                        lwarn!(
                            "system",
                            LogStage::Cache,
                            LogComponent::KeepAlive,
                            "too_many_errors",
                            "保活续期错误过多，停止跟踪",
                            key = %key,
                            errors = errors,
                            error = %e
                        );
                    } else if let Some(mut tracked) = self.entries.get_mut(&key) {
                        tracked.errors = errors;
                        tracked.next_touch = now + Duration::from_secs(self.config.min_interval_secs);
                    }
                }
            }
        }
        round
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::error::{RelayError, Result};
    use async_trait::async_trait;
    use rstest::rstest;

    #[rstest]
    #[case(3_600, 300, 60, 3_360)]
    #[case(3_600, 300, 200, 3_450)]
    #[case(120, 300, 60, 60)]
    #[case(40, 300, 60, 20)]
    fn test_touch_lands_inside_window(
        #[case] expiry: u64,
        #[case] window: u64,
        #[case] interval: u64,
        #[case] expected: u64,
    ) {
        let delay = next_touch_delay(
            Duration::from_secs(expiry),
            Duration::from_secs(window),
            Duration::from_secs(interval),
        );
        assert_eq!(delay, Duration::from_secs(expected));
        assert!(delay < Duration::from_secs(expiry));
    }

    fn config() -> KeepAliveConfig {
        KeepAliveConfig {
            refresh_window_secs: 300,
            min_interval_secs: 30,
            max_interval_secs: 120,
            max_lifetime_secs: 4 * 3_600,
            max_errors: 2,
        }
    }

    #[tokio::test]
    async fn test_touch_and_drop_absent() {
        let cache = Arc::new(MemoryCache::new(16));
        cache
            .set_with_ttl("task:live", "1", Some(Duration::from_secs(600)))
            .await
            .unwrap();
        let manager = KeepAliveManager::new(cache, config());
        manager.add_key("task:live", Duration::from_secs(600));
        manager.add_key("task:gone", Duration::from_secs(600));

        let later = Instant::now() + Duration::from_secs(600);
        let round = manager.run_once(later).await;
        assert_eq!(round, KeepAliveRound { touched: 1, dropped: 1 });
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_max_lifetime_drops() {
        let cache = Arc::new(MemoryCache::new(16));
        let manager = KeepAliveManager::new(cache, config());
        manager.add_key("k", Duration::from_secs(600));
        let round = manager.run_once(Instant::now() + Duration::from_secs(5 * 3_600)).await;
        assert_eq!(round.dropped, 1);
        assert!(manager.is_empty());
    }

    struct FailingCache;

    #[async_trait]
    impl CacheBackend for FailingCache {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }
        async fn exists(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool> {
            Err(RelayError::cache("connection refused"))
        }
        async fn ttl(&self, _key: &str) -> Result<Option<Duration>> {
            Ok(None)
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        fn backend_name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_errors_accumulate_then_drop() {
        let manager = KeepAliveManager::new(Arc::new(FailingCache), config());
        manager.add_key("k", Duration::from_secs(600));
        let t1 = Instant::now() + Duration::from_secs(600);
        assert_eq!(manager.run_once(t1).await.dropped, 0);
        assert_eq!(manager.len(), 1);
        let t2 = t1 + Duration::from_secs(60);
        assert_eq!(manager.run_once(t2).await.dropped, 1);
        assert!(manager.is_empty());
    }
}
