//! # 限流后端抽象

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// 窗口操作方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    /// 当前计数 < 上限时追加并放行
    Allow,
    /// 只比较不追加
    Peek,
    /// 无条件追加
    Record,
}

impl WindowMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Peek => "peek",
            Self::Record => "record",
        }
    }
}

/// 令牌桶判定结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketDecision {
    pub allowed: bool,
    /// 拒绝时距离下一个令牌可用的时间
    pub retry_after: Duration,
}

impl BucketDecision {
    #[must_use]
    pub const fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }
}

/// 限流存储后端
///
/// 每个操作的"淘汰、求和、比较、追加"在后端内部原子完成，
/// 比较使用淘汰之后、追加之前的计数。
#[async_trait]
pub trait LimiterBackend: Send + Sync {
    /// 并发数 < `limit` 时加一并返回 `true`
    async fn acquire_concurrency(&self, key: &str, limit: i64) -> Result<bool>;

    /// 并发数减一，不会低于零
    async fn release_concurrency(&self, key: &str) -> Result<()>;

    /// 在当前线程上同步释放并发计数，后端不支持时返回 `false`
    fn release_concurrency_now(&self, _key: &str) -> bool {
        false
    }

    /// 滑动窗口，`count` 为本次追加的样本值
    async fn sliding_window(
        &self,
        key: &str,
        limit: i64,
        window: Duration,
        expiry: Duration,
        count: i64,
        mode: WindowMode,
    ) -> Result<bool>;

    /// 本地自然日计数窗口，键在下一个本地零点过期
    async fn daily(&self, key: &str, limit: i64, count: i64, mode: WindowMode) -> Result<bool>;

    /// 令牌桶：先按速率补充再尝试扣除 `cost`
    async fn token_bucket(
        &self,
        key: &str,
        capacity: f64,
        rate_per_sec: f64,
        cost: f64,
    ) -> Result<BucketDecision>;

    /// 清理过期数据，返回清理的键数量
    async fn sweep(&self) -> usize {
        0
    }

    fn name(&self) -> &'static str;
}
