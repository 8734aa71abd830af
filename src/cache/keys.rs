//! # 缓存键命名规范
//!
//! 限流、保活等共享状态统一通过 `CacheKey` 生成键名，Redis 后端再加上配置的前缀。

use std::fmt;

/// 缓存键类型
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// 并发计数 - `ratelimit:conc:{scope}`
    Concurrency { scope: String },

    /// 滑动窗口 - `ratelimit:{kind}:{scope}`，kind 为 rpm / tpm / sw
    Window { kind: &'static str, scope: String },

    /// 自然日计数 - `ratelimit:{kind}:{scope}:{day}`
    Daily {
        kind: &'static str,
        scope: String,
        day: String,
    },

    /// 令牌桶 - `ratelimit:tb:{scope}`
    TokenBucket { scope: String },

    /// 异步任务状态 - `task:{platform}:{task_id}`
    Task { platform: String, task_id: String },

    /// 自定义键 - `custom:{prefix}:{key}`
    Custom { prefix: String, key: String },
}

impl CacheKey {
    /// 生成缓存键字符串
    #[must_use]
    pub fn build(&self) -> String {
        match self {
            Self::Concurrency { scope } => format!("ratelimit:conc:{}", sanitize(scope)),
            Self::Window { kind, scope } => format!("ratelimit:{kind}:{}", sanitize(scope)),
            Self::Daily { kind, scope, day } => {
                format!("ratelimit:{kind}:{}:{day}", sanitize(scope))
            }
            Self::TokenBucket { scope } => format!("ratelimit:tb:{}", sanitize(scope)),
            Self::Task { platform, task_id } => format!("task:{platform}:{task_id}"),
            Self::Custom { prefix, key } => format!("custom:{prefix}:{key}"),
        }
    }

    /// 带前缀的完整键名，前缀为空时与 `build` 相同
    #[must_use]
    pub fn prefixed(&self, prefix: &str) -> String {
        if prefix.is_empty() {
            self.build()
        } else {
            format!("{prefix}:{}", self.build())
        }
    }

    /// 获取缓存键的命名空间
    #[must_use]
    pub const fn namespace(&self) -> &'static str {
        match self {
            Self::Concurrency { .. }
            | Self::Window { .. }
            | Self::Daily { .. }
            | Self::TokenBucket { .. } => "ratelimit",
            Self::Task { .. } => "task",
            Self::Custom { .. } => "custom",
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.build())
    }
}

/// 去掉键名中的空白，避免模型名里的空格破坏 Redis 命令
fn sanitize(scope: &str) -> String {
    scope.replace(char::is_whitespace, "_")
}

/// 缓存键构建器
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    #[must_use]
    pub fn concurrency(scope: &str) -> CacheKey {
        CacheKey::Concurrency {
            scope: scope.to_string(),
        }
    }

    /// 滑动窗口键
    #[must_use]
    pub fn window(kind: &'static str, scope: &str) -> CacheKey {
        CacheKey::Window {
            kind,
            scope: scope.to_string(),
        }
    }

    /// 自然日计数键，`day` 为本地日期 `YYYY-MM-DD`
    #[must_use]
    pub fn daily(kind: &'static str, scope: &str, day: &str) -> CacheKey {
        CacheKey::Daily {
            kind,
            scope: scope.to_string(),
            day: day.to_string(),
        }
    }

    #[must_use]
    pub fn token_bucket(scope: &str) -> CacheKey {
        CacheKey::TokenBucket {
            scope: scope.to_string(),
        }
    }

    #[must_use]
    pub fn task(platform: &str, task_id: &str) -> CacheKey {
        CacheKey::Task {
            platform: platform.to_string(),
            task_id: task_id.to_string(),
        }
    }

    #[must_use]
    pub fn custom(prefix: &str, key: &str) -> CacheKey {
        CacheKey::Custom {
            prefix: prefix.to_string(),
            key: key.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_key_building() {
        assert_eq!(
            CacheKeyBuilder::concurrency("user:42").build(),
            "ratelimit:conc:user:42"
        );
        assert_eq!(
            CacheKeyBuilder::window("rpm", "user:42").build(),
            "ratelimit:rpm:user:42"
        );
        assert_eq!(
            CacheKeyBuilder::daily("rpd", "user:42", "2025-03-01").build(),
            "ratelimit:rpd:user:42:2025-03-01"
        );
        assert_eq!(
            CacheKeyBuilder::task("kling", "task_abc").build(),
            "task:kling:task_abc"
        );
    }

    #[test]
    fn test_prefix_and_sanitize() {
        let key = CacheKeyBuilder::window("tpm", "ch:7:0:my model");
        assert_eq!(key.prefixed("relay"), "relay:ratelimit:tpm:ch:7:0:my_model");
        assert_eq!(key.prefixed(""), "ratelimit:tpm:ch:7:0:my_model");
        assert_eq!(key.namespace(), "ratelimit");
    }
}
