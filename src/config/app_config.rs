//! # 应用配置结构定义

use super::DatabaseConfig;
use super::options::RuntimeOptions;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 应用主配置结构
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// 服务监听配置
    pub server: ServerConfig,
    /// 数据库配置
    pub database: DatabaseConfig,
    /// 缓存配置
    pub cache: CacheConfig,
    /// 转发配置
    pub relay: RelayConfig,
    /// 限流配置
    pub rate_limit: RateLimitConfig,
    /// 渠道维护配置
    pub channel: ChannelConfig,
    /// 计费后台任务配置
    pub billing: BillingConfig,
    /// 异步任务配置
    pub task: TaskConfig,
    /// 缓存保活配置
    pub keepalive: KeepAliveConfig,
    /// 最近调用记录配置
    pub recent_calls: RecentCallsConfig,
    /// 流量监控与优雅停机
    pub traffic: TrafficConfig,
    /// 日志配置
    pub logging: LoggingConfig,
    /// 运行时可热更新的选项
    pub options: RuntimeOptions,
}

/// 服务监听配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 访问 `/api/recent-calls` 所需的管理令牌，未配置时接口关闭
    pub admin_token: Option<String>,
    /// 请求体大小上限（字节）
    pub max_body_bytes: usize,
    /// 是否为主节点；仅主节点运行任务轮询与订阅重置
    pub master_node: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            admin_token: None,
            max_body_bytes: 32 * 1024 * 1024,
            master_node: true,
        }
    }
}

/// 缓存类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// 内存缓存
    #[default]
    Memory,
    /// Redis缓存
    Redis,
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// 缓存类型
    pub cache_type: CacheType,
    /// 内存缓存最大条目数
    pub memory_max_entries: u64,
    /// 默认过期时间（秒）
    pub default_ttl: u64,
    /// Redis 缓存配置
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_type: CacheType::Memory,
            memory_max_entries: 10_000,
            default_ttl: 300,
            redis: None,
        }
    }
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// 连接超时时间（秒）
    pub connection_timeout: u64,
    /// 键前缀
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            connection_timeout: 10,
            key_prefix: "relay".to_string(),
        }
    }
}

/// 转发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// 单次转发超时（秒），对应 `RELAY_TIMEOUT`，0 表示不限制
    pub timeout_secs: u64,
    /// 上游连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 流式响应转发缓冲的分块数
    pub stream_buffer_chunks: usize,
    /// 单次请求转发给客户端的最大字节数
    pub max_response_bytes: u64,
    /// 图片下载大小上限
    pub image_max_bytes: usize,
    /// 图片下载超时（秒）
    pub image_timeout_secs: u64,
    /// 按服务商覆盖鉴权头名称，例如 `anthropic = "x-api-key"`
    pub header_key_overrides: HashMap<String, String>,
    /// 实时会话刷新预扣活动时间的间隔（秒）
    pub realtime_heartbeat_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            connect_timeout_secs: 15,
            stream_buffer_chunks: 64,
            max_response_bytes: 256 * 1024 * 1024,
            image_max_bytes: 20 * 1024 * 1024,
            image_timeout_secs: 30,
            header_key_overrides: HashMap::new(),
            realtime_heartbeat_secs: 60,
        }
    }
}

/// 单个分组的用户级限流参数，0 表示不限制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UserLimits {
    pub concurrency: i64,
    pub rpm: i64,
    pub tpm: i64,
    pub rpd: i64,
    pub tpd: i64,
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// 内存后端过期样本清理周期（秒）
    pub sweep_interval_secs: u64,
    /// 默认限流参数
    pub default_limits: UserLimits,
    /// 按用户分组覆盖
    pub group_limits: HashMap<String, UserLimits>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: 300,
            default_limits: UserLimits::default(),
            group_limits: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// 获取分组的限流参数
    #[must_use]
    pub fn limits_for(&self, group: &str) -> UserLimits {
        self.group_limits
            .get(group)
            .copied()
            .unwrap_or(self.default_limits)
    }
}

/// 渠道维护配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// 渠道缓存刷新周期（秒），对应 `CHANNEL_UPDATE_FREQUENCY`
    pub update_frequency_secs: u64,
    /// 自动禁用渠道的恢复检查周期（秒），对应 `CHANNEL_TEST_FREQUENCY`
    pub test_frequency_secs: u64,
    /// 是否启用自动禁用
    pub auto_disable: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            update_frequency_secs: 60,
            test_frequency_secs: 86_400,
            auto_disable: true,
        }
    }
}

/// 计费后台任务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// 订阅重置检查周期（秒）
    pub subscription_reset_interval_secs: u64,
    /// 每次重置的最大条目数
    pub subscription_reset_batch: u64,
    /// 预扣记录清理周期（秒）
    pub reservation_cleanup_interval_secs: u64,
    /// 预扣记录保留天数
    pub reservation_retention_days: i64,
    /// 对账任务周期（秒）
    pub reconcile_interval_secs: u64,
    /// 预扣记录超过该时长仍未结算时由对账任务退还（秒）
    pub reconcile_grace_secs: i64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            subscription_reset_interval_secs: 60,
            subscription_reset_batch: 300,
            reservation_cleanup_interval_secs: 1_800,
            reservation_retention_days: 7,
            reconcile_interval_secs: 300,
            reconcile_grace_secs: 900,
        }
    }
}

/// 异步任务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub poll_interval_secs: u64,
    pub batch_size: u64,
    pub timeout_secs: i64,
    /// 轮询时同时在途的渠道查询数
    pub max_concurrency: usize,
    /// 单渠道同时进行的提交数，0 表示不限制
    pub channel_submit_concurrency: i64,
    /// 任务状态键的过期时间（秒），任务未结束前由保活续期
    pub state_ttl_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            batch_size: 50,
            timeout_secs: 3_600,
            max_concurrency: 10,
            channel_submit_concurrency: 0,
            state_ttl_secs: 600,
        }
    }
}

/// 缓存保活配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// 到期前多久开始续期（秒）
    pub refresh_window_secs: u64,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub max_lifetime_secs: u64,
    pub max_errors: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            refresh_window_secs: 300,
            min_interval_secs: 30,
            max_interval_secs: 120,
            max_lifetime_secs: 4 * 3_600,
            max_errors: 5,
        }
    }
}

/// 最近调用记录配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecentCallsConfig {
    pub capacity: usize,
    pub max_body_bytes: usize,
    pub max_chunk_bytes: usize,
    pub max_chunks: usize,
    /// 是否记录请求/响应体，对应 `REQUEST_PERSISTENCE_ENABLED`
    pub persist_bodies: bool,
}

impl Default for RecentCallsConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            max_body_bytes: 64 * 1024,
            max_chunk_bytes: 4 * 1024,
            max_chunks: 512,
            persist_bodies: true,
        }
    }
}

/// 流量监控与优雅停机配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// 对应 `TRAFFIC_MONITOR_ENABLED`
    pub monitor_enabled: bool,
    /// 对应 `TRAFFIC_GRACEFUL_TIMEOUT`（秒）
    pub graceful_timeout_secs: u64,
    pub report_interval_secs: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            monitor_enabled: false,
            graceful_timeout_secs: 30,
            report_interval_secs: 60,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// 成功请求日志采样率，对应 `LOG_SAMPLE_RATIO`
    pub sample_ratio: f64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            sample_ratio: 1.0,
        }
    }
}

impl AppConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be greater than 0".to_string());
        }
        if self.database.backend == super::StoreBackend::Database && self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.cache.cache_type == CacheType::Redis && self.cache.redis.is_none() {
            return Err("cache.redis must be configured when cache_type = \"redis\"".to_string());
        }
        if self.relay.realtime_heartbeat_secs == 0 {
            return Err("relay.realtime_heartbeat_secs must be greater than 0".to_string());
        }
        if self.relay.stream_buffer_chunks == 0 {
            return Err("relay.stream_buffer_chunks must be greater than 0".to_string());
        }
        if self.task.batch_size == 0 || self.task.max_concurrency == 0 {
            return Err("task.batch_size and task.max_concurrency must be greater than 0".to_string());
        }
        if self.task.state_ttl_secs == 0 {
            return Err("task.state_ttl_secs must be greater than 0".to_string());
        }
        if self.keepalive.min_interval_secs > self.keepalive.max_interval_secs {
            return Err("keepalive.min_interval_secs must not exceed max_interval_secs".to_string());
        }
        if self.recent_calls.capacity == 0 {
            return Err("recent_calls.capacity must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.logging.sample_ratio) {
            return Err("logging.sample_ratio must be within [0, 1]".to_string());
        }
        self.options.validate()
    }
}
