//! # 限流模块
//!
//! 用户级（并发、RPM、TPM、RPD、TPD）与渠道级（按模型的 rpm/tpm/rpd、日预算）限流。
//! 后端出错时记录日志并放行。

pub mod backend;
pub mod memory;
pub mod permit;
pub mod redis;
pub mod scripts;

pub use backend::{BucketDecision, LimiterBackend, WindowMode};
pub use memory::MemoryLimiter;
pub use permit::ConcurrencyPermit;
pub use redis::RedisLimiter;

use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheHandles, CacheKeyBuilder};
use crate::channel::ModelCaps;
use crate::config::{RateLimitConfig, UserLimits};
use crate::error::{RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::types::{ChannelId, TokenId, UserId, local_day_key, seconds_until_local_midnight};
use crate::{ldebug, lwarn};

/// 滑动窗口长度
pub const MINUTE: Duration = Duration::from_secs(60);

/// 限流维度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Concurrency,
    Rpm,
    Tpm,
    Rpd,
    Tpd,
}

impl LimitKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Concurrency => "concurrency",
            Self::Rpm => "rpm",
            Self::Tpm => "tpm",
            Self::Rpd => "rpd",
            Self::Tpd => "tpd",
        }
    }

    /// 建议客户端等待的秒数
    fn retry_after_secs(self) -> u64 {
        match self {
            Self::Concurrency => 1,
            Self::Rpm | Self::Tpm => MINUTE.as_secs(),
            Self::Rpd | Self::Tpd => seconds_until_local_midnight(Local::now()),
        }
    }
}

/// 准入请求
#[derive(Debug, Clone)]
pub struct AdmissionRequest<'a> {
    pub request_id: &'a str,
    pub user_id: UserId,
    pub group: &'a str,
    /// 准入时预估的 token 数，计入 TPM/TPD
    pub declared_tokens: u64,
}

/// 准入结果，持有并发许可直到请求结束
#[derive(Debug)]
pub struct Admission {
    pub permit: ConcurrencyPermit,
    scope: String,
    limits: UserLimits,
    declared_tokens: i64,
}

impl Admission {
    /// 未启用限流时的空准入
    #[must_use]
    pub fn unrestricted() -> Self {
        Self {
            permit: ConcurrencyPermit::none(),
            scope: String::new(),
            limits: UserLimits::default(),
            declared_tokens: 0,
        }
    }
}

/// 用户维度的键
#[must_use]
pub fn user_scope(user_id: UserId) -> String {
    format!("user:{user_id}")
}

/// 渠道密钥在某个模型上的键
#[must_use]
pub fn channel_scope(channel_id: ChannelId, key_index: usize, model: &str) -> String {
    format!("ch:{channel_id}:{key_index}:{model}")
}

/// 渠道日预算的键
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetScope<'a> {
    Token(TokenId),
    ClientIp(&'a str),
}

fn budget_scope(channel_id: ChannelId, scope: &BudgetScope<'_>) -> String {
    match scope {
        BudgetScope::Token(token_id) => format!("budget:ch:{channel_id}:tok:{token_id}"),
        BudgetScope::ClientIp(ip) => format!("budget:ch:{channel_id}:ip:{ip}"),
    }
}

/// 限流器
#[derive(Clone)]
pub struct RateLimiter {
    backend: Arc<dyn LimiterBackend>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn LimiterBackend>, config: RateLimitConfig) -> Self {
        Self { backend, config }
    }

    /// 使用进程内后端
    #[must_use]
    pub fn memory(config: RateLimitConfig) -> Self {
        Self::new(Arc::new(MemoryLimiter::new()), config)
    }

    /// 根据缓存配置选择后端：存在 Redis 客户端时使用分布式后端
    #[must_use]
    pub fn from_cache(handles: &CacheHandles, config: RateLimitConfig) -> Self {
        match &handles.redis {
            Some(client) => Self::new(Arc::new(RedisLimiter::new(client.clone())), config),
            None => Self::memory(config),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn LimiterBackend> {
        &self.backend
    }

    #[must_use]
    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// 后端错误时放行
    fn fail_open<T>(&self, operation: &'static str, key: &str, result: Result<T>, allowed: T) -> T {
        result.unwrap_or_else(|e| {
            lwarn!(
                "system",
                LogStage::RateLimit,
                LogComponent::RateLimiter,
                operation,
                "限流后端异常，按放行处理",
                backend = self.backend.name(),
                key = %key,
                error = %e
            );
            allowed
        })
    }

    async fn window(&self, kind: &'static str, scope: &str, limit: i64, count: i64, mode: WindowMode) -> bool {
        let key = CacheKeyBuilder::window(kind, scope).build();
        let result = self
            .backend
            .sliding_window(&key, limit, MINUTE, MINUTE * 2, count, mode)
            .await;
        self.fail_open("sliding_window", &key, result, true)
    }

    async fn day(&self, kind: &'static str, scope: &str, limit: i64, count: i64, mode: WindowMode) -> bool {
        let day = local_day_key(Local::now());
        let key = CacheKeyBuilder::daily(kind, scope, &day).build();
        let result = self.backend.daily(&key, limit, count, mode).await;
        self.fail_open("daily", &key, result, true)
    }

    /// 并发检查；`limit` ≤ 0 表示不限制
    pub async fn check_concurrency(&self, scope: &str, limit: i64) -> (bool, ConcurrencyPermit) {
        if limit <= 0 {
            return (true, ConcurrencyPermit::none());
        }
        let key = CacheKeyBuilder::concurrency(scope).build();
        let result = self.backend.acquire_concurrency(&key, limit).await;
        match result {
            Ok(true) => (true, ConcurrencyPermit::acquired(Arc::clone(&self.backend), key)),
            Ok(false) => (false, ConcurrencyPermit::none()),
            Err(e) => {
                self.fail_open::<()>("acquire_concurrency", &key, Err(e), ());
                (true, ConcurrencyPermit::none())
            }
        }
    }

    /// 60 秒滑动窗口请求数
    pub async fn check_rpm(&self, scope: &str, limit: i64) -> bool {
        limit <= 0 || self.window("rpm", scope, limit, 1, WindowMode::Allow).await
    }

    /// 60 秒滑动窗口 token 数，放行时计入预估值
    pub async fn check_tpm(&self, scope: &str, limit: i64, tokens: i64) -> bool {
        limit <= 0 || self.window("tpm", scope, limit, tokens, WindowMode::Allow).await
    }

    /// 追加实际消耗的 token（可以为负，用于冲抵准入时的预估）
    pub async fn record_tokens(&self, scope: &str, tokens: i64) {
        if tokens != 0 {
            self.window("tpm", scope, i64::MAX, tokens, WindowMode::Record).await;
        }
    }

    /// 本地自然日请求数
    pub async fn check_rpd(&self, scope: &str, limit: i64) -> bool {
        limit <= 0 || self.day("rpd", scope, limit, 1, WindowMode::Allow).await
    }

    /// 本地自然日 token 数
    pub async fn check_tpd(&self, scope: &str, limit: i64, tokens: i64) -> bool {
        limit <= 0 || self.day("tpd", scope, limit, tokens, WindowMode::Allow).await
    }

    pub async fn record_daily_tokens(&self, scope: &str, tokens: i64) {
        if tokens != 0 {
            self.day("tpd", scope, i64::MAX, tokens, WindowMode::Record).await;
        }
    }

    pub async fn peek_rpm(&self, scope: &str, limit: i64) -> bool {
        limit <= 0 || self.window("rpm", scope, limit, 0, WindowMode::Peek).await
    }

    pub async fn peek_tpm(&self, scope: &str, limit: i64) -> bool {
        limit <= 0 || self.window("tpm", scope, limit, 0, WindowMode::Peek).await
    }

    pub async fn peek_rpd(&self, scope: &str, limit: i64) -> bool {
        limit <= 0 || self.day("rpd", scope, limit, 0, WindowMode::Peek).await
    }

    /// 通用滑动窗口
    pub async fn allow_sliding_window(
        &self,
        scope: &str,
        max: i64,
        window: Duration,
        expiry: Duration,
    ) -> bool {
        let key = CacheKeyBuilder::window("sw", scope).build();
        let result = self
            .backend
            .sliding_window(&key, max, window, expiry, 1, WindowMode::Allow)
            .await;
        self.fail_open("allow_sliding_window", &key, result, true)
    }

    /// 令牌桶
    pub async fn allow_token_bucket(&self, scope: &str, capacity: f64, rate_per_sec: f64, cost: f64) -> bool {
        self.take_token(scope, capacity, rate_per_sec, cost).await.allowed
    }

    async fn take_token(&self, scope: &str, capacity: f64, rate_per_sec: f64, cost: f64) -> BucketDecision {
        let key = CacheKeyBuilder::token_bucket(scope).build();
        let result = self
            .backend
            .token_bucket(&key, capacity, rate_per_sec, cost)
            .await;
        self.fail_open("token_bucket", &key, result, BucketDecision::allowed())
    }

    /// 等待令牌可用，取消令牌触发时返回 `ClientGone`
    pub async fn wait_token_bucket(
        &self,
        scope: &str,
        capacity: f64,
        rate_per_sec: f64,
        cost: f64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cost > capacity {
            return Err(RelayError::invalid_request(format!(
                "令牌消耗 {cost} 超过桶容量 {capacity}"
            )));
        }
        loop {
            let decision = self.take_token(scope, capacity, rate_per_sec, cost).await;
            if decision.allowed {
                return Ok(());
            }
            let wait = decision
                .retry_after
                .clamp(Duration::from_millis(10), Duration::from_secs(5));
            tokio::select! {
                () = cancel.cancelled() => return Err(RelayError::ClientGone),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// 用户级准入：并发 → RPD → RPM → TPD → TPM，首个拒绝生效
    pub async fn admit(&self, request: &AdmissionRequest<'_>) -> Result<Admission> {
        if !self.config.enabled {
            return Ok(Admission::unrestricted());
        }
        let limits = self.config.limits_for(request.group);
        let scope = user_scope(request.user_id);
        let declared = i64::try_from(request.declared_tokens).unwrap_or(i64::MAX);

        let (allowed, permit) = self.check_concurrency(&scope, limits.concurrency).await;
        if !allowed {
            return Err(self.denied(request, LimitKind::Concurrency, limits.concurrency));
        }

        let checks = [
            (LimitKind::Rpd, limits.rpd),
            (LimitKind::Rpm, limits.rpm),
            (LimitKind::Tpd, limits.tpd),
            (LimitKind::Tpm, limits.tpm),
        ];
        for (kind, limit) in checks {
            let ok = match kind {
                LimitKind::Rpd => self.check_rpd(&scope, limit).await,
                LimitKind::Rpm => self.check_rpm(&scope, limit).await,
                LimitKind::Tpd => self.check_tpd(&scope, limit, declared).await,
                LimitKind::Tpm => self.check_tpm(&scope, limit, declared).await,
                LimitKind::Concurrency => true,
            };
            if !ok {
                permit.release().await;
                return Err(self.denied(request, kind, limit));
            }
        }

        Ok(Admission {
            permit,
            scope,
            limits,
            declared_tokens: declared,
        })
    }

    fn denied(&self, request: &AdmissionRequest<'_>, kind: LimitKind, limit: i64) -> RelayError {
        let retry_after = kind.retry_after_secs();
        ldebug!(
            request.request_id,
            LogStage::RateLimit,
            LogComponent::RateLimiter,
            "denied",
            "请求被限流",
            user_id = request.user_id,
            kind = kind.as_str(),
            limit = limit,
            retry_after = retry_after
        );
        RelayError::rate_limited(
            format!("已达到{}限制 ({limit})", kind.as_str().to_uppercase()),
            retry_after,
        )
    }

    /// 结算后用实际 token 数冲抵准入时的预估
    pub async fn settle_admission(&self, admission: &Admission, actual_tokens: u64) {
        if admission.scope.is_empty() {
            return;
        }
        let actual = i64::try_from(actual_tokens).unwrap_or(i64::MAX);
        let delta = actual - admission.declared_tokens;
        if admission.limits.tpm > 0 {
            self.record_tokens(&admission.scope, delta).await;
        }
        if admission.limits.tpd > 0 {
            self.record_daily_tokens(&admission.scope, delta).await;
        }
    }

    /// 渠道密钥在该模型上的 rpm/tpm/rpd 是否都未超限（不记录）
    pub async fn peek_channel_caps(
        &self,
        channel_id: ChannelId,
        key_index: usize,
        model: &str,
        caps: &ModelCaps,
    ) -> bool {
        if caps.is_unlimited() {
            return true;
        }
        let scope = channel_scope(channel_id, key_index, model);
        self.peek_rpm(&scope, caps.rpm).await
            && self.peek_tpm(&scope, caps.tpm).await
            && self.peek_rpd(&scope, caps.rpd).await
    }

    /// 派发时记录渠道请求数
    pub async fn record_channel_request(
        &self,
        channel_id: ChannelId,
        key_index: usize,
        model: &str,
        caps: &ModelCaps,
    ) {
        let scope = channel_scope(channel_id, key_index, model);
        if caps.rpm > 0 {
            self.window("rpm", &scope, i64::MAX, 1, WindowMode::Record).await;
        }
        if caps.rpd > 0 {
            self.day("rpd", &scope, i64::MAX, 1, WindowMode::Record).await;
        }
    }

    /// 结算后记录渠道 token 数
    pub async fn record_channel_tokens(
        &self,
        channel_id: ChannelId,
        key_index: usize,
        model: &str,
        caps: &ModelCaps,
        tokens: u64,
    ) {
        if caps.tpm > 0 {
            let scope = channel_scope(channel_id, key_index, model);
            self.record_tokens(&scope, i64::try_from(tokens).unwrap_or(i64::MAX))
                .await;
        }
    }

    /// 渠道日预算是否仍有余量
    pub async fn peek_daily_budget(&self, channel_id: ChannelId, scope: &BudgetScope<'_>, budget: i64) -> bool {
        budget <= 0 || self.day("rpd", &budget_scope(channel_id, scope), budget, 0, WindowMode::Peek).await
    }

    /// 派发时记录渠道日预算
    pub async fn record_daily_budget(&self, channel_id: ChannelId, scope: &BudgetScope<'_>) {
        self.day("rpd", &budget_scope(channel_id, scope), i64::MAX, 1, WindowMode::Record)
            .await;
    }

    /// 清理过期样本
    pub async fn sweep(&self) -> usize {
        self.backend.sweep().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserLimits;
    use std::collections::HashMap;

    fn limiter(limits: UserLimits) -> (RateLimiter, Arc<MemoryLimiter>) {
        let backend = Arc::new(MemoryLimiter::new());
        let config = RateLimitConfig {
            default_limits: limits,
            group_limits: HashMap::new(),
            ..RateLimitConfig::default()
        };
        (RateLimiter::new(backend.clone(), config), backend)
    }

    fn request(user_id: UserId, tokens: u64) -> AdmissionRequest<'static> {
        AdmissionRequest {
            request_id: "req-test",
            user_id,
            group: "default",
            declared_tokens: tokens,
        }
    }

    #[tokio::test]
    async fn test_concurrency_permit_released_on_drop() {
        let (limiter, backend) = limiter(UserLimits {
            concurrency: 1,
            ..UserLimits::default()
        });
        let admission = limiter.admit(&request(1, 0)).await.unwrap();
        assert!(admission.permit.is_held());
        assert!(limiter.admit(&request(1, 0)).await.is_err());

        drop(admission);
        assert_eq!(backend.in_flight("ratelimit:conc:user:1"), 0);
        assert!(limiter.admit(&request(1, 0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_later_denial_releases_concurrency() {
        let (limiter, backend) = limiter(UserLimits {
            concurrency: 5,
            rpm: 1,
            ..UserLimits::default()
        });
        let first = limiter.admit(&request(2, 0)).await.unwrap();
        let err = limiter.admit(&request(2, 0)).await.unwrap_err();
        assert!(matches!(err, RelayError::RateLimited { retry_after_secs: 60, .. }));
        assert_eq!(backend.in_flight("ratelimit:conc:user:2"), 1);
        first.permit.release().await;
        assert_eq!(backend.in_flight("ratelimit:conc:user:2"), 0);
    }

    #[tokio::test]
    async fn test_tpm_settles_to_actual_usage() {
        let (limiter, _) = limiter(UserLimits {
            tpm: 1_000,
            ..UserLimits::default()
        });
        let admission = limiter.admit(&request(3, 4_000)).await.unwrap();
        // 预估 4000 已超过上限
        assert!(limiter.admit(&request(3, 1)).await.is_err());

        limiter.settle_admission(&admission, 100).await;
        assert!(limiter.admit(&request(3, 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_disabled_limiter_admits_everything() {
        let backend = Arc::new(MemoryLimiter::new());
        let limiter = RateLimiter::new(
            backend,
            RateLimitConfig {
                enabled: false,
                default_limits: UserLimits {
                    rpm: 1,
                    ..UserLimits::default()
                },
                ..RateLimitConfig::default()
            },
        );
        for _ in 0..5 {
            assert!(limiter.admit(&request(4, 0)).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_channel_caps_peek_and_record() {
        let (limiter, _) = limiter(UserLimits::default());
        let caps = ModelCaps {
            rpm: 2,
            tpm: 0,
            rpd: 0,
        };
        assert!(limiter.peek_channel_caps(7, 0, "gpt-4o", &caps).await);
        limiter.record_channel_request(7, 0, "gpt-4o", &caps).await;
        limiter.record_channel_request(7, 0, "gpt-4o", &caps).await;
        assert!(!limiter.peek_channel_caps(7, 0, "gpt-4o", &caps).await);
        assert!(limiter.peek_channel_caps(7, 1, "gpt-4o", &caps).await);
    }

    #[tokio::test]
    async fn test_daily_budget() {
        let (limiter, _) = limiter(UserLimits::default());
        let scope = BudgetScope::ClientIp("10.0.0.1");
        assert!(limiter.peek_daily_budget(9, &scope, 1).await);
        limiter.record_daily_budget(9, &scope).await;
        assert!(!limiter.peek_daily_budget(9, &scope, 1).await);
        assert!(limiter.peek_daily_budget(9, &BudgetScope::Token(5), 1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_token_bucket_cancellation() {
        let (limiter, _) = limiter(UserLimits::default());
        let cancel = CancellationToken::new();
        assert!(limiter.allow_token_bucket("tb", 1.0, 0.001, 1.0).await);

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.wait_token_bucket("tb", 1.0, 0.001, 1.0, &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(RelayError::ClientGone)));
    }
}
