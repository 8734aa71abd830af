//! # 日志配置模块
//!
//! 统一的结构化日志：阶段 + 组件 + 操作名，配合 `linfo!` 等宏使用

use std::env;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt as tfmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 请求处理所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStage {
    Startup,
    Shutdown,
    Configuration,
    Authentication,
    RateLimit,
    Scheduling,
    Billing,
    RequestModify,
    UpstreamRequest,
    Response,
    ResponseFailure,
    BackgroundTask,
    Cache,
    Db,
    Internal,
    Error,
}

impl LogStage {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Configuration => "configuration",
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::Scheduling => "scheduling",
            Self::Billing => "billing",
            Self::RequestModify => "request_modify",
            Self::UpstreamRequest => "upstream_request",
            Self::Response => "response",
            Self::ResponseFailure => "response_failure",
            Self::BackgroundTask => "background_task",
            Self::Cache => "cache",
            Self::Db => "db",
            Self::Internal => "internal",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 产生日志的组件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogComponent {
    Main,
    ServerSetup,
    Config,
    Auth,
    RateLimiter,
    ChannelRegistry,
    ChannelSelector,
    Affinity,
    Adaptor,
    ClaudeAdaptor,
    GeminiAdaptor,
    OpenAiAdaptor,
    Relay,
    Realtime,
    TaskManager,
    TaskPoller,
    Billing,
    Subscription,
    Reconciler,
    KeepAlive,
    RecentCalls,
    Cache,
    Database,
    Scheduler,
    Traffic,
}

impl LogComponent {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::ServerSetup => "server_setup",
            Self::Config => "config",
            Self::Auth => "auth",
            Self::RateLimiter => "rate_limiter",
            Self::ChannelRegistry => "channel_registry",
            Self::ChannelSelector => "channel_selector",
            Self::Affinity => "affinity",
            Self::Adaptor => "adaptor",
            Self::ClaudeAdaptor => "claude_adaptor",
            Self::GeminiAdaptor => "gemini_adaptor",
            Self::OpenAiAdaptor => "openai_adaptor",
            Self::Relay => "relay",
            Self::Realtime => "realtime",
            Self::TaskManager => "task_manager",
            Self::TaskPoller => "task_poller",
            Self::Billing => "billing",
            Self::Subscription => "subscription",
            Self::Reconciler => "reconciler",
            Self::KeepAlive => "keep_alive",
            Self::RecentCalls => "recent_calls",
            Self::Cache => "cache",
            Self::Database => "database",
            Self::Scheduler => "scheduler",
            Self::Traffic => "traffic",
        }
    }
}

impl fmt::Display for LogComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 成功请求日志的采样率（f64 位模式存储）
static SAMPLE_RATIO_BITS: AtomicU64 = AtomicU64::new(0x3FF0_0000_0000_0000);

/// 设置成功日志采样率，取值会被钳制到 [0, 1]
pub fn set_sample_ratio(ratio: f64) {
    let ratio = if ratio.is_nan() { 1.0 } else { ratio.clamp(0.0, 1.0) };
    SAMPLE_RATIO_BITS.store(ratio.to_bits(), Ordering::Relaxed);
}

/// 当前采样率
#[must_use]
pub fn sample_ratio() -> f64 {
    f64::from_bits(SAMPLE_RATIO_BITS.load(Ordering::Relaxed))
}

/// 本次成功日志是否需要输出；错误日志不受采样影响
#[must_use]
pub fn should_sample() -> bool {
    let ratio = sample_ratio();
    ratio >= 1.0 || (ratio > 0.0 && fastrand::f64() < ratio)
}

/// 初始化日志系统
pub fn init_logging(log_level: Option<&String>) {
    let level = log_level.map_or("info", String::as_str);

    let default_filter = format!(
        "{level},relay_gateway=debug,sqlx::query=off,sea_orm::query=warn,sqlx=warn,hyper=warn"
    );

    let log_filter = env::var("RUST_LOG").unwrap_or(default_filter);

    // 测试中可能重复初始化，忽略已初始化错误
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into()))
        .with(
            tfmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init();
}

/// 结构化 info 日志
#[macro_export]
macro_rules! linfo {
    ($rid:expr, $stage:expr, $component:expr, $op:expr, $msg:expr $(, $($field:tt)+)?) => {
        ::tracing::info!(
            request_id = %$rid,
            stage = %$stage,
            component = %$component,
            operation = $op,
            $($($field)+ ,)?
            "{}", $msg
        )
    };
}

/// 结构化 debug 日志
#[macro_export]
macro_rules! ldebug {
    ($rid:expr, $stage:expr, $component:expr, $op:expr, $msg:expr $(, $($field:tt)+)?) => {
        ::tracing::debug!(
            request_id = %$rid,
            stage = %$stage,
            component = %$component,
            operation = $op,
            $($($field)+ ,)?
            "{}", $msg
        )
    };
}

/// 结构化 warn 日志
#[macro_export]
macro_rules! lwarn {
    ($rid:expr, $stage:expr, $component:expr, $op:expr, $msg:expr $(, $($field:tt)+)?) => {
        ::tracing::warn!(
            request_id = %$rid,
            stage = %$stage,
            component = %$component,
            operation = $op,
            $($($field)+ ,)?
            "{}", $msg
        )
    };
}

/// 结构化 error 日志
#[macro_export]
macro_rules! lerror {
    ($rid:expr, $stage:expr, $component:expr, $op:expr, $msg:expr $(, $($field:tt)+)?) => {
        ::tracing::error!(
            request_id = %$rid,
            stage = %$stage,
            component = %$component,
            operation = $op,
            $($($field)+ ,)?
            "{}", $msg
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_sample_ratio_clamped() {
        set_sample_ratio(3.0);
        assert!((sample_ratio() - 1.0).abs() < f64::EPSILON);
        assert!(should_sample());
        set_sample_ratio(0.0);
        assert!(!should_sample());
        set_sample_ratio(1.0);
    }

    #[test]
    #[serial]
    fn test_sample_ratio_nan_resets_to_full() {
        set_sample_ratio(f64::NAN);
        assert!((sample_ratio() - 1.0).abs() < f64::EPSILON);
        set_sample_ratio(-0.5);
        assert!(sample_ratio().abs() < f64::EPSILON);
        set_sample_ratio(1.0);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(LogStage::UpstreamRequest.to_string(), "upstream_request");
        assert_eq!(LogComponent::ClaudeAdaptor.to_string(), "claude_adaptor");
    }
}
