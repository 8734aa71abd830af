//! # 缓存模块
//!
//! Redis 客户端、内存 TTL 缓存以及统一的键命名

pub mod client;
pub mod keys;
pub mod memory;

pub use client::{LuaScript, RedisClient};
pub use keys::{CacheKey, CacheKeyBuilder};
pub use memory::MemoryCache;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CacheConfig, CacheType};
use crate::error::{RelayError, Result};

/// 缓存后端抽象
///
/// 只包含字符串键值与过期操作，限流等需要原子语义的场景直接使用
/// `RedisClient::eval_script`。
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// 写入缓存，`ttl` 为 `None` 时不过期
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// 重新设置过期时间，键不存在时返回 `false`
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// 剩余过期时间，键不存在或不过期时返回 `None`
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    async fn close(&self) -> Result<()>;

    fn backend_name(&self) -> &'static str;
}

/// 按配置创建的缓存句柄
#[derive(Clone)]
pub struct CacheHandles {
    pub backend: Arc<dyn CacheBackend>,
    /// 分布式模式下的 Redis 客户端，供限流器执行脚本
    pub redis: Option<RedisClient>,
}

/// 按配置初始化缓存后端
pub async fn init_cache(config: &CacheConfig) -> Result<CacheHandles> {
    match config.cache_type {
        CacheType::Memory => Ok(CacheHandles {
            backend: Arc::new(MemoryCache::new(
                usize::try_from(config.memory_max_entries).unwrap_or(usize::MAX),
            )),
            redis: None,
        }),
        CacheType::Redis => {
            let redis_config = config
                .redis
                .clone()
                .ok_or_else(|| RelayError::config("cache.redis 未配置"))?;
            let client = RedisClient::new(redis_config).await?;
            client.ping().await?;
            Ok(CacheHandles {
                backend: Arc::new(client.clone()),
                redis: Some(client),
            })
        }
    }
}
