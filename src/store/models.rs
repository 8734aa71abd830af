//! # 持久化领域模型

use crate::billing::BillingSnapshot;
use crate::types::{
    AccountStatus, BillingPreference, BillingSource, ChannelId, Quota, SubscriptionItemId,
    TokenId, UserId,
};
use serde::{Deserialize, Serialize};

/// 用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub group: String,
    /// 钱包余额
    pub quota: Quota,
    pub status: AccountStatus,
    pub billing_preference: BillingPreference,
    /// 余额低于该值时记录告警
    pub warning_threshold: Quota,
}

/// 用户令牌
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub user_id: UserId,
    pub name: String,
    /// `sk-...` 密钥的 SHA-256 十六进制
    pub key_hash: String,
    pub remain_quota: Quota,
    pub unlimited: bool,
    pub allowed_groups: Vec<String>,
    pub allowed_models: Vec<String>,
    pub expires_at: Option<i64>,
    pub status: AccountStatus,
}

impl Token {
    /// 是否允许访问该模型；空列表表示不限制
    #[must_use]
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }

    /// 是否允许使用该分组；空列表表示只能使用用户自身分组
    #[must_use]
    pub fn allows_group(&self, group: &str, user_group: &str) -> bool {
        if self.allowed_groups.is_empty() {
            group == user_group
        } else {
            self.allowed_groups.iter().any(|g| g == group)
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at > 0 && at <= now)
    }
}

/// 订阅额度类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaType {
    /// 按次数计
    PerCall,
    /// 按额度计
    Quota,
}

impl QuotaType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PerCall => "per_call",
            Self::Quota => "quota",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        if s == "per_call" { Self::PerCall } else { Self::Quota }
    }
}

/// 订阅额度项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: SubscriptionItemId,
    pub user_id: UserId,
    pub plan_id: i64,
    pub quota_type: QuotaType,
    pub total: i64,
    pub consumed: i64,
    /// 0 表示不重置
    pub reset_period_secs: i64,
    pub next_reset_at: Option<i64>,
    pub expires_at: Option<i64>,
}

impl SubscriptionItem {
    #[must_use]
    pub const fn remaining(&self) -> i64 {
        self.total - self.consumed
    }

    #[must_use]
    pub fn is_active(&self, now: i64) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// 预扣记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Open,
    Settled,
    Refunded,
}

impl ReservationState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Settled => "settled",
            Self::Refunded => "refunded",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "settled" => Self::Settled,
            "refunded" => Self::Refunded,
            _ => Self::Open,
        }
    }
}

/// 一次预扣
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub request_id: String,
    pub user_id: UserId,
    pub token_id: TokenId,
    pub channel_id: Option<ChannelId>,
    pub model: String,
    pub source: BillingSource,
    /// 从钱包或订阅项预留的数量（订阅按次计费时为 1）
    pub amount: Quota,
    /// 从令牌预留的额度；无限额令牌为 0
    pub token_amount: Quota,
    /// 预扣对应的额度值，用于计算结算差额
    pub quota: Quota,
    pub state: ReservationState,
    pub settled_quota: Option<Quota>,
    pub created_at: i64,
    /// 最近一次活动时间；长连接会话定期刷新，对账以此判断是否遗留
    pub touched_at: i64,
}

/// 日志类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Consume,
    Refund,
    System,
    Error,
}

impl LogKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Consume => "consume",
            Self::Refund => "refund",
            Self::System => "system",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "consume" => Self::Consume,
            "refund" => Self::Refund,
            "error" => Self::Error,
            _ => Self::System,
        }
    }
}

/// 消费日志
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub kind: LogKind,
    pub request_id: String,
    pub user_id: UserId,
    pub token_id: Option<TokenId>,
    pub channel_id: Option<ChannelId>,
    pub model: String,
    pub quota: Quota,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub content: String,
    pub created_at: i64,
}

impl LogEntry {
    /// 创建一条日志，时间取当前
    #[must_use]
    pub fn new(kind: LogKind, request_id: impl Into<String>, user_id: UserId) -> Self {
        Self {
            kind,
            request_id: request_id.into(),
            user_id,
            token_id: None,
            channel_id: None,
            model: String::new(),
            quota: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            content: String::new(),
            created_at: crate::types::now_timestamp(),
        }
    }
}

/// 异步任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Submitted,
    Queued,
    InProgress,
    Success,
    Failure,
}

impl TaskStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(Self::Submitted),
            "queued" => Some(Self::Queued),
            "in_progress" => Some(Self::InProgress),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }

    /// 终态任务只结算一次
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

/// 异步任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// 对外暴露的任务 id
    pub task_id: String,
    pub upstream_task_id: String,
    pub platform: String,
    pub request_id: String,
    pub user_id: UserId,
    pub token_id: TokenId,
    pub channel_id: ChannelId,
    pub action: String,
    pub model: String,
    pub status: TaskStatus,
    pub progress: String,
    pub fail_reason: Option<String>,
    /// 预扣额度
    pub quota: Quota,
    pub billing_source: BillingSource,
    pub submit_time: i64,
    pub finish_time: Option<i64>,
    /// 上游返回的原始数据
    pub data: serde_json::Value,
    pub billing_snapshot: BillingSnapshot,
}
