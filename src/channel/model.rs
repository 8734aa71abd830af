//! # 渠道模型
//!
//! 渠道及其密钥的状态机：单密钥渠道整体禁用，多密钥渠道按密钥禁用，
//! 全部密钥被禁用时渠道自身转为自动禁用。

use crate::types::{ChannelId, ProviderKind, Quota};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 余额耗尽类禁用原因的前缀，恢复任务不会自动启用这类渠道
pub const INSUFFICIENT_QUOTA_PREFIX: &str = "insufficient_quota:";

/// 多密钥渠道全部密钥被禁用时渠道的禁用原因
pub const ALL_KEYS_DISABLED: &str = "all keys disabled";

/// 渠道或密钥状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

/// 密钥状态与渠道状态取值相同
pub type KeyStatus = ChannelStatus;

impl ChannelStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::ManuallyDisabled => "manually_disabled",
            Self::AutoDisabled => "auto_disabled",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "manually_disabled" => Self::ManuallyDisabled,
            "auto_disabled" => Self::AutoDisabled,
            _ => Self::Enabled,
        }
    }

    #[must_use]
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// 单个上游密钥
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyState {
    pub secret: String,
    #[serde(default)]
    pub status: KeyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_at: Option<i64>,
}

impl KeyState {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            status: KeyStatus::Enabled,
            disabled_reason: None,
            disabled_at: None,
        }
    }
}

/// 每模型的速率上限，0 表示不限制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ModelCaps {
    pub rpm: i64,
    pub tpm: i64,
    pub rpd: i64,
}

impl ModelCaps {
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.rpm <= 0 && self.tpm <= 0 && self.rpd <= 0
    }
}

/// 禁用操作的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableOutcome {
    /// 仅禁用了一个密钥
    KeyDisabled(usize),
    /// 渠道整体被禁用
    ChannelDisabled,
    /// 状态未变化（已禁用或手动禁用）
    Unchanged,
}

/// 上游渠道
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub provider: ProviderKind,
    /// 单个 URL，或多端点 JSON 映射
    pub base_url: String,
    pub keys: Vec<KeyState>,
    pub models: Vec<String>,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    pub groups: Vec<String>,
    #[serde(default)]
    pub model_caps: HashMap<String, ModelCaps>,
    /// 每个 (渠道, 令牌) 与 (渠道, 客户端 IP) 的每日请求上限
    #[serde(default)]
    pub daily_request_budget: Option<i64>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub status: ChannelStatus,
    #[serde(default)]
    pub disabled_reason: Option<String>,
    #[serde(default)]
    pub disabled_at: Option<i64>,
    #[serde(default)]
    pub used_quota: Quota,
    #[serde(default)]
    pub header_overrides: HashMap<String, String>,
    #[serde(default)]
    pub other: serde_json::Value,
}

impl Channel {
    /// 以最小字段构造渠道，其余取默认值
    #[must_use]
    pub fn new(
        id: ChannelId,
        provider: ProviderKind,
        base_url: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: format!("channel-{id}"),
            provider,
            base_url: base_url.into(),
            keys: vec![KeyState::new(secret)],
            models: Vec::new(),
            model_mapping: HashMap::new(),
            groups: vec!["default".to_string()],
            model_caps: HashMap::new(),
            daily_request_budget: None,
            priority: 0,
            weight: 0,
            status: ChannelStatus::Enabled,
            disabled_reason: None,
            disabled_at: None,
            used_quota: 0,
            header_overrides: HashMap::new(),
            other: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub const fn is_multi_key(&self) -> bool {
        self.keys.len() > 1
    }

    /// 启用状态的密钥下标
    pub fn enabled_key_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.keys
            .iter()
            .enumerate()
            .filter(|(_, key)| key.status.is_enabled())
            .map(|(index, _)| index)
    }

    /// 渠道可被选中：自身启用且至少一个密钥启用
    #[must_use]
    pub fn is_selectable(&self) -> bool {
        self.status.is_enabled() && self.enabled_key_indices().next().is_some()
    }

    #[must_use]
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// 映射后的上游模型名
    #[must_use]
    pub fn upstream_model(&self, model: &str) -> String {
        self.model_mapping
            .get(model)
            .filter(|mapped| !mapped.is_empty())
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    #[must_use]
    pub fn caps_for(&self, model: &str) -> ModelCaps {
        self.model_caps.get(model).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn key(&self, index: usize) -> Option<&KeyState> {
        self.keys.get(index)
    }

    /// 按上游错误禁用密钥或渠道
    ///
    /// 单密钥渠道整体转为自动禁用；多密钥渠道仅禁用该密钥，全部密钥禁用后渠道随之禁用。
    /// 手动禁用的对象不受影响。
    pub fn apply_auto_disable(&mut self, key_index: usize, reason: &str, now: i64) -> DisableOutcome {
        if self.status == ChannelStatus::ManuallyDisabled {
            return DisableOutcome::Unchanged;
        }

        if !self.is_multi_key() {
            if self.status == ChannelStatus::AutoDisabled {
                return DisableOutcome::Unchanged;
            }
            self.status = ChannelStatus::AutoDisabled;
            self.disabled_reason = Some(reason.to_string());
            self.disabled_at = Some(now);
            return DisableOutcome::ChannelDisabled;
        }

        let Some(key) = self.keys.get_mut(key_index) else {
            return DisableOutcome::Unchanged;
        };
        if !key.status.is_enabled() {
            return DisableOutcome::Unchanged;
        }
        key.status = KeyStatus::AutoDisabled;
        key.disabled_reason = Some(reason.to_string());
        key.disabled_at = Some(now);

        if self.enabled_key_indices().next().is_none() && self.status.is_enabled() {
            self.status = ChannelStatus::AutoDisabled;
            self.disabled_reason = Some(ALL_KEYS_DISABLED.to_string());
            self.disabled_at = Some(now);
            return DisableOutcome::ChannelDisabled;
        }
        DisableOutcome::KeyDisabled(key_index)
    }

    /// 恢复自动禁用且原因不是余额耗尽的密钥与渠道，返回是否有变化
    pub fn reenable_auto_disabled(&mut self) -> bool {
        let mut changed = false;

        for key in &mut self.keys {
            if key.status == KeyStatus::AutoDisabled && is_recoverable(key.disabled_reason.as_deref()) {
                key.status = KeyStatus::Enabled;
                key.disabled_reason = None;
                key.disabled_at = None;
                changed = true;
            }
        }

        if self.status == ChannelStatus::AutoDisabled
            && is_recoverable(self.disabled_reason.as_deref())
            && self.enabled_key_indices().next().is_some()
        {
            self.status = ChannelStatus::Enabled;
            self.disabled_reason = None;
            self.disabled_at = None;
            changed = true;
        }

        changed
    }

    /// 启用指定密钥；渠道因密钥耗尽被自动禁用时一并恢复
    pub fn enable_key(&mut self, key_index: usize) -> bool {
        let Some(key) = self.keys.get_mut(key_index) else {
            return false;
        };
        let mut changed = false;
        if !key.status.is_enabled() {
            key.status = KeyStatus::Enabled;
            key.disabled_reason = None;
            key.disabled_at = None;
            changed = true;
        }
        if self.status == ChannelStatus::AutoDisabled
            && self.disabled_reason.as_deref() == Some(ALL_KEYS_DISABLED)
        {
            self.status = ChannelStatus::Enabled;
            self.disabled_reason = None;
            self.disabled_at = None;
            changed = true;
        }
        changed
    }
}

fn is_recoverable(reason: Option<&str>) -> bool {
    !reason.is_some_and(|r| r.starts_with(INSUFFICIENT_QUOTA_PREFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multi_key_channel() -> Channel {
        let mut channel = Channel::new(1, ProviderKind::OpenAi, "https://api.example.com", "k1");
        channel.keys.push(KeyState::new("k2"));
        channel
    }

    #[test]
    fn test_single_key_disables_channel() {
        let mut channel = Channel::new(13, ProviderKind::OpenAi, "https://x", "k");
        let outcome = channel.apply_auto_disable(0, "status 401: invalid key", 100);
        assert_eq!(outcome, DisableOutcome::ChannelDisabled);
        assert_eq!(channel.status, ChannelStatus::AutoDisabled);
        assert!(channel.keys[0].status.is_enabled());
        assert!(!channel.is_selectable());
        assert_eq!(channel.apply_auto_disable(0, "again", 101), DisableOutcome::Unchanged);
    }

    #[test]
    fn test_multi_key_disables_key_then_channel() {
        let mut channel = multi_key_channel();
        assert_eq!(
            channel.apply_auto_disable(0, "status 403: forbidden", 1),
            DisableOutcome::KeyDisabled(0)
        );
        assert!(channel.is_selectable());
        assert_eq!(channel.enabled_key_indices().collect::<Vec<_>>(), vec![1]);

        assert_eq!(
            channel.apply_auto_disable(1, "status 403: forbidden", 2),
            DisableOutcome::ChannelDisabled
        );
        assert_eq!(channel.status, ChannelStatus::AutoDisabled);

        assert!(channel.enable_key(1));
        assert_eq!(channel.status, ChannelStatus::Enabled);
    }

    #[test]
    fn test_reenable_skips_insufficient_quota() {
        let mut channel = multi_key_channel();
        channel.apply_auto_disable(0, "insufficient_quota: status 429: billing", 1);
        channel.apply_auto_disable(1, "status 401: bad key", 1);
        assert!(channel.reenable_auto_disabled());

        assert_eq!(channel.keys[0].status, KeyStatus::AutoDisabled);
        assert!(channel.keys[1].status.is_enabled());
        assert_eq!(channel.status, ChannelStatus::Enabled);
    }

    #[test]
    fn test_manual_disable_untouched() {
        let mut channel = Channel::new(2, ProviderKind::Gemini, "https://x", "k");
        channel.status = ChannelStatus::ManuallyDisabled;
        assert_eq!(channel.apply_auto_disable(0, "status 401: x", 1), DisableOutcome::Unchanged);
        assert!(!channel.reenable_auto_disabled());
        assert_eq!(channel.status, ChannelStatus::ManuallyDisabled);
    }

    #[test]
    fn test_model_mapping() {
        let mut channel = Channel::new(3, ProviderKind::OpenAi, "https://x", "k");
        channel.model_mapping.insert("gpt-4o".into(), "gpt-4o-2024-11-20".into());
        channel.model_mapping.insert("empty".into(), String::new());
        assert_eq!(channel.upstream_model("gpt-4o"), "gpt-4o-2024-11-20");
        assert_eq!(channel.upstream_model("empty"), "empty");
        assert_eq!(channel.upstream_model("other"), "other");
    }
}
