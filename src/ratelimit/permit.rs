//! # 并发许可

use std::sync::Arc;

use super::backend::LimiterBackend;
use crate::logging::{LogComponent, LogStage};
use crate::lwarn;

struct Held {
    backend: Arc<dyn LimiterBackend>,
    key: String,
}

/// 并发许可
///
/// 显式 `release` 或析构时释放一次，请求处理任务 panic 展开时同样会释放。
#[must_use = "许可被丢弃时立即释放并发计数"]
pub struct ConcurrencyPermit {
    held: Option<Held>,
}

impl ConcurrencyPermit {
    /// 不占用计数的许可（未限制或被拒绝）
    pub const fn none() -> Self {
        Self { held: None }
    }

    pub(crate) fn acquired(backend: Arc<dyn LimiterBackend>, key: String) -> Self {
        Self {
            held: Some(Held { backend, key }),
        }
    }

    /// 是否占用了一个并发计数
    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// 释放许可
    pub async fn release(mut self) {
        if let Some(held) = self.held.take() {
            if let Err(e) = held.backend.release_concurrency(&held.key).await {
                lwarn!(
                    "system",
                    LogStage::RateLimit,
                    LogComponent::RateLimiter,
                    "release_failed",
                    "释放并发计数失败",
                    key = %held.key,
                    error = %e
                );
            }
        }
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        if held.backend.release_concurrency_now(&held.key) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = held.backend.release_concurrency(&held.key).await {
                        lwarn!(
                            "system",
                            LogStage::RateLimit,
                            LogComponent::RateLimiter,
                            "release_failed",
                            "释放并发计数失败",
                            key = %held.key,
                            error = %e
                        );
                    }
                });
            }
            Err(_) => {
                lwarn!(
                    "system",
                    LogStage::RateLimit,
                    LogComponent::RateLimiter,
                    "release_without_runtime",
                    "运行时已关闭，并发计数依赖过期时间回收",
                    key = %held.key
                );
            }
        }
    }
}

impl std::fmt::Debug for ConcurrencyPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyPermit")
            .field("key", &self.held.as_ref().map(|h| h.key.as_str()))
            .finish()
    }
}
