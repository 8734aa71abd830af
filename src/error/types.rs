//! # 错误类型定义

use axum::http::StatusCode;
use thiserror::Error;

/// 网络错误分类
///
/// 用于区分瞬时网络故障与其它错误，瞬时故障允许重试且不会触发渠道禁用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkClass {
    /// 请求超时
    Timeout,
    /// 连接被重置
    ConnectionReset,
    /// 请求截止时间已过
    DeadlineExceeded,
    /// 建立连接失败
    Connect,
    /// 上游返回空响应
    EmptyResponse,
    /// 其它网络错误
    Other,
}

/// 应用主要错误类型
#[derive(Debug, Error)]
pub enum RelayError {
    /// 配置相关错误
    #[error("配置错误: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 数据库相关错误
    #[error("数据库错误: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 缓存相关错误
    #[error("缓存错误: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 网络通信错误
    #[error("网络错误: {message}")]
    Network {
        message: String,
        class: NetworkClass,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 认证失败
    #[error("认证错误: {message}")]
    Auth { message: String },

    /// 令牌或用户额度不足（准入阶段）
    #[error("额度不足: {message}")]
    InsufficientQuota { message: String },

    /// 模型不在令牌允许范围内
    #[error("模型不可用: {model}")]
    ModelNotPermitted { model: String },

    /// 没有可用渠道
    #[error("当前分组 {group} 下对于模型 {model} 无可用渠道")]
    NoAvailableChannel { group: String, model: String },

    /// 预扣费失败
    #[error("预扣费失败: {message}")]
    PreConsume { message: String },

    /// 速率限制
    #[error("速率限制: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: u64,
    },

    /// 上游返回的错误
    #[error("上游错误 ({status}): {message}")]
    Upstream {
        status: u16,
        message: String,
        error_type: Option<String>,
        code: Option<String>,
        insufficient_quota: bool,
    },

    /// 协议转换错误
    #[error("转换错误: {message}")]
    Translation { message: String },

    /// 请求参数错误
    #[error("请求错误: {message}")]
    InvalidRequest { message: String },

    /// 资源未找到
    #[error("未找到: {message}")]
    NotFound { message: String },

    /// 序列化/反序列化错误
    #[error("序列化错误: {message}")]
    Serialization {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    /// IO相关错误
    #[error("IO错误: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// 客户端已断开
    #[error("客户端已断开连接")]
    ClientGone,

    /// 系统内部错误
    #[error("内部错误: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 附加上下文的错误
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<RelayError>,
    },
}

impl RelayError {
    /// 将错误转换为HTTP状态码和错误代码
    pub fn to_http_response_parts(&self) -> (StatusCode, &str) {
        match self {
            Self::Config { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            Self::Database { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            Self::Cache { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "CACHE_ERROR"),
            Self::Network { class, .. } => match class {
                NetworkClass::Timeout | NetworkClass::DeadlineExceeded => {
                    (StatusCode::GATEWAY_TIMEOUT, "UPSTREAM_TIMEOUT")
                }
                _ => (StatusCode::BAD_GATEWAY, "NETWORK_ERROR"),
            },
            Self::Auth { .. } => (StatusCode::UNAUTHORIZED, "AUTH_ERROR"),
            Self::InsufficientQuota { .. } => (StatusCode::FORBIDDEN, "INSUFFICIENT_QUOTA"),
            Self::ModelNotPermitted { .. } => (StatusCode::FORBIDDEN, "MODEL_NOT_PERMITTED"),
            Self::NoAvailableChannel { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "NO_AVAILABLE_CHANNEL")
            }
            Self::PreConsume { .. } => (StatusCode::FORBIDDEN, "PRE_CONSUME_FAILED"),
            Self::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMIT_ERROR"),
            Self::Upstream { status, .. } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                "UPSTREAM_ERROR",
            ),
            Self::Translation { .. } => (StatusCode::BAD_REQUEST, "TRANSLATION_ERROR"),
            Self::InvalidRequest { .. } => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            Self::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::Serialization { .. } => (StatusCode::BAD_REQUEST, "SERIALIZATION_ERROR"),
            Self::Io { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            Self::ClientGone => (StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST), "CLIENT_CLOSED"),
            Self::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            Self::Context { source, .. } => source.to_http_response_parts(),
        }
    }

    /// HTTP 状态码与规范错误类型
    #[must_use]
    pub fn status_and_type(&self) -> (StatusCode, String) {
        (self.status_code(), self.error_type())
    }

    /// HTTP 状态码
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.to_http_response_parts().0
    }

    /// 面向客户端的规范错误类型
    #[must_use]
    pub fn error_type(&self) -> String {
        match self {
            Self::Auth { .. } => "authentication_error".to_string(),
            Self::InsufficientQuota { .. } | Self::PreConsume { .. } => {
                "insufficient_quota".to_string()
            }
            Self::ModelNotPermitted { .. } => "permission_error".to_string(),
            Self::RateLimited { .. } => "rate_limit_error".to_string(),
            Self::Upstream { error_type, .. } => error_type
                .clone()
                .unwrap_or_else(|| "upstream_error".to_string()),
            Self::Translation { .. } | Self::InvalidRequest { .. } | Self::Serialization { .. } => {
                "invalid_request_error".to_string()
            }
            Self::NotFound { .. } => "not_found_error".to_string(),
            Self::NoAvailableChannel { .. } | Self::Network { .. } => {
                "upstream_unavailable".to_string()
            }
            Self::Context { source, .. } => source.error_type(),
            _ => "api_error".to_string(),
        }
    }

    /// 可选的错误代码
    #[must_use]
    pub fn code(&self) -> Option<String> {
        match self {
            Self::Upstream { code, .. } => code.clone(),
            Self::Context { source, .. } => source.code(),
            other => Some(other.to_http_response_parts().1.to_lowercase()),
        }
    }

    /// 面向客户端的错误消息
    ///
    /// 内部错误只暴露通用描述。
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Upstream { message, .. } => message.clone(),
            Self::Internal { .. }
            | Self::Database { .. }
            | Self::Cache { .. }
            | Self::Io { .. }
            | Self::Config { .. } => "服务内部错误，请稍后重试".to_string(),
            Self::Context { source, .. } => source.client_message(),
            other => other.to_string(),
        }
    }

    /// 是否可以切换渠道重试：网络类错误、上游 5xx 与 429
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Upstream { status, .. } => *status == 429 || *status >= 500,
            Self::Context { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// 是否属于瞬时网络错误
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Upstream { status, .. } => *status == 500,
            Self::Context { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// 建议的重试等待秒数
    #[must_use]
    pub const fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// 错误分类
    #[must_use]
    pub fn category(&self) -> super::ErrorCategory {
        if self.status_code().is_client_error() {
            super::ErrorCategory::Client
        } else {
            super::ErrorCategory::Server
        }
    }

    /// 创建配置错误
    pub fn config<T: Into<String>>(message: T) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的配置错误
    pub fn config_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建数据库错误
    pub fn database<T: Into<String>>(message: T) -> Self {
        Self::Database {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的数据库错误
    pub fn database_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Database {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建缓存错误
    pub fn cache<T: Into<String>>(message: T) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的缓存错误
    pub fn cache_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Cache {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建网络错误
    pub fn network<T: Into<String>>(message: T, class: NetworkClass) -> Self {
        Self::Network {
            message: message.into(),
            class,
            source: None,
        }
    }

    /// 创建带来源的网络错误
    pub fn network_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        class: NetworkClass,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            class,
            source: Some(source.into()),
        }
    }

    /// 创建认证错误
    pub fn auth<T: Into<String>>(message: T) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// 创建额度不足错误
    pub fn insufficient_quota<T: Into<String>>(message: T) -> Self {
        Self::InsufficientQuota {
            message: message.into(),
        }
    }

    /// 创建无可用渠道错误
    pub fn no_available_channel<G: Into<String>, M: Into<String>>(group: G, model: M) -> Self {
        Self::NoAvailableChannel {
            group: group.into(),
            model: model.into(),
        }
    }

    /// 创建预扣费错误
    pub fn pre_consume<T: Into<String>>(message: T) -> Self {
        Self::PreConsume {
            message: message.into(),
        }
    }

    /// 创建速率限制错误
    pub fn rate_limited<T: Into<String>>(message: T, retry_after_secs: u64) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after_secs,
        }
    }

    /// 创建上游错误
    pub fn upstream<T: Into<String>>(status: u16, message: T) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
            error_type: None,
            code: None,
            insufficient_quota: false,
        }
    }

    /// 创建转换错误
    pub fn translation<T: Into<String>>(message: T) -> Self {
        Self::Translation {
            message: message.into(),
        }
    }

    /// 创建请求参数错误
    pub fn invalid_request<T: Into<String>>(message: T) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// 创建资源未找到错误
    pub fn not_found<T: Into<String>>(message: T) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// 创建序列化错误
    pub fn serialization<T: Into<String>, E: Into<anyhow::Error>>(message: T, source: E) -> Self {
        Self::Serialization {
            message: message.into(),
            source: source.into(),
        }
    }

    /// 创建内部错误
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的内部错误
    pub fn internal_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 剥离上下文包装后的原始错误
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: "文件操作失败".to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for RelayError {
    fn from(err: toml::de::Error) -> Self {
        Self::config_with_source("TOML解析失败", err)
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: "JSON处理失败".to_string(),
            source: err.into(),
        }
    }
}

impl From<sea_orm::error::DbErr> for RelayError {
    fn from(err: sea_orm::error::DbErr) -> Self {
        Self::database_with_source("数据库操作失败", err)
    }
}

// Redis错误转换
impl From<redis::RedisError> for RelayError {
    fn from(err: redis::RedisError) -> Self {
        Self::cache_with_source("Redis操作失败", err)
    }
}

// Reqwest错误转换，按超时/连接/其它分类
impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        let class = if err.is_timeout() {
            NetworkClass::Timeout
        } else if err.is_connect() {
            NetworkClass::Connect
        } else if err.is_body() || err.is_decode() {
            NetworkClass::ConnectionReset
        } else {
            NetworkClass::Other
        };
        Self::network_with_source("HTTP请求失败", class, err)
    }
}

impl From<tokio::time::error::Elapsed> for RelayError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::network_with_source("请求超过截止时间", NetworkClass::DeadlineExceeded, err)
    }
}
