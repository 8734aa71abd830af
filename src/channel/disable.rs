//! # 自动禁用策略

use super::model::INSUFFICIENT_QUOTA_PREFIX;
use crate::error::RelayError;

/// 余额耗尽类错误的特征文本
const INSUFFICIENT_QUOTA_MARKERS: &[&str] = &[
    "insufficient_quota",
    "exceeded your current quota",
    "billing hard limit",
    "billing_hard_limit_reached",
    "credit balance is too low",
];

/// 瞬时错误的特征文本，出现时不禁用
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "deadline exceeded",
    "internal server error",
    "empty response",
];

/// 上游错误是否表示账户余额耗尽
#[must_use]
pub fn is_insufficient_quota(error_type: Option<&str>, code: Option<&str>, message: &str) -> bool {
    if error_type == Some("insufficient_quota") || code == Some("insufficient_quota") {
        return true;
    }
    let lower = message.to_ascii_lowercase();
    INSUFFICIENT_QUOTA_MARKERS.iter().any(|m| lower.contains(m))
}

fn looks_transient(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// 派发失败后是否应禁用密钥或渠道
///
/// 余额耗尽总是禁用；否则仅 401、403、429 且不属于瞬时错误时禁用。
#[must_use]
pub fn should_disable(error: &RelayError) -> bool {
    match error.root() {
        RelayError::Upstream {
            insufficient_quota: true,
            ..
        } => true,
        RelayError::Upstream { status, message, .. } => {
            matches!(status, 401 | 403 | 429) && !looks_transient(message)
        }
        _ => false,
    }
}

/// 持久化的禁用原因：`status <code>: <message>`，余额耗尽时加上前缀
#[must_use]
pub fn disable_reason(error: &RelayError) -> String {
    match error.root() {
        RelayError::Upstream {
            status,
            message,
            insufficient_quota,
            ..
        } => {
            let base = format!("status {status}: {message}");
            if *insufficient_quota {
                format!("{INSUFFICIENT_QUOTA_PREFIX} {base}")
            } else {
                base
            }
        }
        other => other.to_string(),
    }
}
