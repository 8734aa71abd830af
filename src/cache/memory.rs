//! # 内存 TTL 缓存
//!
//! 单节点部署时替代 Redis，为保活管理器等组件提供相同的键过期语义。

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::CacheBackend;
use crate::error::Result;

/// 缓存项
#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// 内存缓存实现
pub struct MemoryCache {
    data: DashMap<String, CacheEntry>,
    max_entries: usize,
}

impl MemoryCache {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            data: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// 清理过期项，返回清理条数
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.data.len())
    }

    /// 容量已满时先清理过期项，仍然不足则淘汰最早过期的条目
    fn ensure_capacity(&self) {
        if self.data.len() < self.max_entries {
            return;
        }
        self.cleanup_expired();
        if self.data.len() < self.max_entries {
            return;
        }
        let victim = self
            .data
            .iter()
            .filter_map(|entry| entry.value().expires_at.map(|at| (at, entry.key().clone())))
            .min_by_key(|(at, _)| *at)
            .map(|(_, key)| key)
            .or_else(|| self.data.iter().next().map(|entry| entry.key().clone()));
        if let Some(key) = victim {
            self.data.remove(&key);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let expired = match self.data.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.data.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        if !self.data.contains_key(key) {
            self.ensure_capacity();
        }
        self.data
            .insert(key.to_string(), CacheEntry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.data.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        match self.data.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        Ok(self.data.get(key).and_then(|entry| {
            entry
                .expires_at
                .filter(|at| *at > now)
                .map(|at| at.duration_since(now))
        }))
    }

    async fn close(&self) -> Result<()> {
        self.data.clear();
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires() {
        let cache = MemoryCache::new(16);
        cache
            .set_with_ttl("k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(!cache.exists("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_extends_only_live_keys() {
        let cache = MemoryCache::new(16);
        cache
            .set_with_ttl("k", "v", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(cache.expire("k", Duration::from_secs(60)).await.unwrap());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cache.exists("k").await.unwrap());
        assert!(!cache.expire("missing", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_capacity_evicts_earliest_expiry() {
        let cache = MemoryCache::new(2);
        cache
            .set_with_ttl("a", "1", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        cache
            .set_with_ttl("b", "2", Some(Duration::from_secs(500)))
            .await
            .unwrap();
        cache
            .set_with_ttl("c", "3", Some(Duration::from_secs(500)))
            .await
            .unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.get("c").await.unwrap().is_some());
    }
}
