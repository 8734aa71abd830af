//! # Redis 缓存客户端
//!
//! 提供 Redis 连接管理、基础操作和 Lua 脚本执行

use async_trait::async_trait;
use redis::{AsyncCommands, Client, ErrorKind, FromRedisValue, ToRedisArgs, aio::ConnectionManager};
use std::time::Duration;

use super::CacheBackend;
use crate::config::RedisConfig;
use crate::error::{RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lerror, linfo, lwarn};

/// Redis 缓存客户端
#[derive(Clone)]
pub struct RedisClient {
    /// Redis 连接管理器，克隆开销很小
    connection_manager: ConnectionManager,
    /// 配置信息
    config: RedisConfig,
}

impl RedisClient {
    /// 创建新的缓存客户端
    pub async fn new(config: RedisConfig) -> Result<Self> {
        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Cache,
            "connect_to_redis",
            "正在连接 Redis 服务器",
            prefix = %config.key_prefix
        );

        let client = Client::open(config.url.as_str())
            .map_err(|e| RelayError::cache_with_source("创建 Redis 客户端失败", e))?;

        let connect = ConnectionManager::new(client);
        let connection_manager =
            tokio::time::timeout(Duration::from_secs(config.connection_timeout), connect)
                .await
                .map_err(|_| RelayError::cache("建立 Redis 连接超时"))?
                .map_err(|e| RelayError::cache_with_source("建立 Redis 连接失败", e))?;

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Cache,
            "redis_connected",
            "Redis 连接建立成功"
        );

        Ok(Self {
            connection_manager,
            config,
        })
    }

    /// 加上配置前缀后的键名
    #[must_use]
    pub fn key(&self, raw: &str) -> String {
        if self.config.key_prefix.is_empty() {
            raw.to_string()
        } else {
            format!("{}:{raw}", self.config.key_prefix)
        }
    }

    /// 获取配置信息
    #[must_use]
    pub const fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// 测试连接
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RelayError::cache_with_source("Redis ping 失败", e))?;

        if response == "PONG" {
            ldebug!("system", LogStage::Cache, LogComponent::Cache, "ping_success", "Redis 连接测试成功");
            Ok(())
        } else {
            lerror!(
                "system",
                LogStage::Cache,
                LogComponent::Cache,
                "ping_fail",
                "Redis ping 响应异常",
                response = %response
            );
            Err(RelayError::cache("Redis 连接测试失败"))
        }
    }

    /// 通过 EVALSHA 执行脚本
    ///
    /// 服务端返回 NOSCRIPT 时执行一次 `SCRIPT LOAD` 后重试，只重试一次。
    /// `keys` 传入未加前缀的键名。
    pub async fn eval_script<T, A>(&self, script: &LuaScript, keys: &[String], args: &[A]) -> Result<T>
    where
        T: FromRedisValue,
        A: ToRedisArgs,
    {
        let prefixed: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        let mut conn = self.connection_manager.clone();

        match Self::evalsha::<T, A>(&mut conn, script, &prefixed, args).await {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == ErrorKind::NoScriptError => {
                ldebug!(
                    "system",
                    LogStage::Cache,
                    LogComponent::Cache,
                    "script_reload",
                    "脚本未缓存，重新加载",
                    sha = %script.hash()
                );
                let _: String = redis::cmd("SCRIPT")
                    .arg("LOAD")
                    .arg(script.source())
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| RelayError::cache_with_source("加载 Lua 脚本失败", e))?;
                Self::evalsha::<T, A>(&mut conn, script, &prefixed, args)
                    .await
                    .map_err(|e| RelayError::cache_with_source("执行 Lua 脚本失败", e))
            }
            Err(e) => Err(RelayError::cache_with_source("执行 Lua 脚本失败", e)),
        }
    }

    async fn evalsha<T, A>(
        conn: &mut ConnectionManager,
        script: &LuaScript,
        keys: &[String],
        args: &[A],
    ) -> redis::RedisResult<T>
    where
        T: FromRedisValue,
        A: ToRedisArgs,
    {
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(script.hash()).arg(keys.len()).arg(keys);
        for arg in args {
            cmd.arg(arg);
        }
        cmd.query_async(conn).await
    }
}

/// Lua 脚本及其 SHA1
#[derive(Debug, Clone)]
pub struct LuaScript {
    source: &'static str,
    hash: String,
}

impl LuaScript {
    #[must_use]
    pub fn new(source: &'static str) -> Self {
        let hash = redis::Script::new(source).get_hash().to_string();
        Self { source, hash }
    }

    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    #[must_use]
    pub const fn source(&self) -> &'static str {
        self.source
    }
}

#[async_trait]
impl CacheBackend for RedisClient {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection_manager.clone();
        conn.get(self.key(key))
            .await
            .map_err(|e| RelayError::cache_with_source(format!("获取缓存失败: {key}"), e))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        let full = self.key(key);
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(full, value, ttl.as_secs().max(1))
                .await
                .map_err(|e| RelayError::cache_with_source(format!("设置缓存失败: {key}"), e)),
            None => conn
                .set::<_, _, ()>(full, value)
                .await
                .map_err(|e| RelayError::cache_with_source(format!("设置缓存失败: {key}"), e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection_manager.clone();
        let deleted: i64 = conn
            .del(self.key(key))
            .await
            .map_err(|e| RelayError::cache_with_source(format!("删除缓存失败: {key}"), e))?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection_manager.clone();
        conn.exists(self.key(key))
            .await
            .map_err(|e| RelayError::cache_with_source(format!("检查缓存存在性失败: {key}"), e))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection_manager.clone();
        let seconds = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        conn.expire(self.key(key), seconds)
            .await
            .map_err(|e| RelayError::cache_with_source(format!("设置缓存过期时间失败: {key}"), e))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection_manager.clone();
        let ttl: i64 = conn
            .ttl(self.key(key))
            .await
            .map_err(|e| RelayError::cache_with_source(format!("获取缓存TTL失败: {key}"), e))?;
        Ok(u64::try_from(ttl).ok().map(Duration::from_secs))
    }

    async fn close(&self) -> Result<()> {
        // ConnectionManager 随最后一个克隆释放，这里只做一次连通性确认
        if let Err(e) = self.ping().await {
            lwarn!(
                "system",
                LogStage::Shutdown,
                LogComponent::Cache,
                "close_ping_failed",
                "关闭前 Redis 已不可用",
                error = %e
            );
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
