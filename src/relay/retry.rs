//! # 重试策略评估
//!
//! 把“是否换渠道重试”的判断从编排器中分离出来。

use crate::error::RelayError;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo};

/// 重试决策结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub reason: RetryReason,
}

/// 重试决策原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// 达到重试上限
    MaxRetryExceeded,
    /// 未配置重试预算
    NoRetryBudget,
    /// 响应头已经发给客户端
    ResponseStarted,
    /// 错误不可重试（4xx、转换错误等）
    Fatal,
    /// 可以重试
    Retryable,
}

impl RetryReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MaxRetryExceeded => "max_retry_exceeded",
            Self::NoRetryBudget => "no_retry_budget",
            Self::ResponseStarted => "response_started",
            Self::Fatal => "fatal",
            Self::Retryable => "retryable",
        }
    }
}

impl RetryDecision {
    #[must_use]
    pub const fn no_retry(reason: RetryReason) -> Self {
        Self {
            should_retry: false,
            reason,
        }
    }

    #[must_use]
    pub const fn retry() -> Self {
        Self {
            should_retry: true,
            reason: RetryReason::Retryable,
        }
    }
}

/// 重试策略评估器
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retry_budget: u32,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_retry_budget: u32) -> Self {
        Self { max_retry_budget }
    }

    #[must_use]
    pub const fn max_retry_budget(&self) -> u32 {
        self.max_retry_budget
    }

    /// 评估一次失败后是否换渠道重试
    ///
    /// 网络类错误、上游 5xx 与 429 可重试；其它 4xx 直接失败。
    #[must_use]
    pub fn evaluate(&self, error: &RelayError, retry_count: u32, response_started: bool) -> RetryDecision {
        if response_started {
            return RetryDecision::no_retry(RetryReason::ResponseStarted);
        }
        if !error.is_retryable() {
            return RetryDecision::no_retry(RetryReason::Fatal);
        }
        if self.max_retry_budget == 0 {
            return RetryDecision::no_retry(RetryReason::NoRetryBudget);
        }
        if retry_count >= self.max_retry_budget {
            return RetryDecision::no_retry(RetryReason::MaxRetryExceeded);
        }
        RetryDecision::retry()
    }

    /// 评估并记录日志
    pub fn evaluate_logged(
        &self,
        request_id: &str,
        error: &RelayError,
        retry_count: u32,
        response_started: bool,
    ) -> RetryDecision {
        let decision = self.evaluate(error, retry_count, response_started);
        if decision.should_retry {
            linfo!(
                request_id,
                LogStage::UpstreamRequest,
                LogComponent::Relay,
                "retry_scheduled",
                "换渠道重试",
                attempt = retry_count + 1,
                max_retry_budget = self.max_retry_budget,
                error = %error
            );
        } else {
            ldebug!(
                request_id,
                LogStage::UpstreamRequest,
                LogComponent::Relay,
                "retry_skipped",
                "不再重试",
                reason = decision.reason.as_str(),
                attempt = retry_count,
                max_retry_budget = self.max_retry_budget
            );
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkClass;
    use rstest::rstest;

    #[rstest]
    #[case(RelayError::upstream(503, "busy"), 0, false, true, RetryReason::Retryable)]
    #[case(RelayError::upstream(429, "slow down"), 2, false, true, RetryReason::Retryable)]
    #[case(RelayError::network("reset", NetworkClass::ConnectionReset), 1, false, true, RetryReason::Retryable)]
    #[case(RelayError::upstream(400, "bad"), 0, false, false, RetryReason::Fatal)]
    #[case(RelayError::upstream(500, "boom"), 3, false, false, RetryReason::MaxRetryExceeded)]
    #[case(RelayError::upstream(500, "boom"), 0, true, false, RetryReason::ResponseStarted)]
    fn test_evaluate(
        #[case] error: RelayError,
        #[case] retry_count: u32,
        #[case] started: bool,
        #[case] should_retry: bool,
        #[case] reason: RetryReason,
    ) {
        let decision = RetryPolicy::new(3).evaluate(&error, retry_count, started);
        assert_eq!(decision.should_retry, should_retry);
        assert_eq!(decision.reason, reason);
    }

    #[test]
    fn test_zero_budget() {
        let decision = RetryPolicy::new(0).evaluate(&RelayError::upstream(502, "x"), 0, false);
        assert_eq!(decision.reason, RetryReason::NoRetryBudget);
    }
}
