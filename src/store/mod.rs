//! # 持久化层
//!
//! 仓储 trait 及其内存与数据库实现。额度的条件扣减在仓储内部原子完成，
//! 调用方不在任何仓储 I/O 期间持有锁。

pub mod database;
pub mod memory;
pub mod models;

pub use database::DatabaseStore;
pub use memory::MemoryStore;
pub use models::{
    LogEntry, LogKind, QuotaType, Reservation, ReservationState, SubscriptionItem, Task,
    TaskStatus, Token, User,
};

use async_trait::async_trait;
use std::sync::Arc;

use crate::channel::Channel;
use crate::error::Result;
use crate::types::{ChannelId, Quota, SubscriptionItemId, TokenId, UserId};

/// 用户钱包
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_user(&self, id: UserId) -> Result<Option<User>>;

    /// 余额不少于 `amount` 时扣减并返回新余额，否则返回 `None`
    async fn try_debit_user(&self, id: UserId, amount: Quota) -> Result<Option<Quota>>;

    /// 无条件调整余额（可为负），返回新余额
    async fn adjust_user_quota(&self, id: UserId, delta: Quota) -> Result<Quota>;
}

/// 用户令牌
#[async_trait]
pub trait TokenRepository: Send + Sync {
    async fn find_token_by_hash(&self, key_hash: &str) -> Result<Option<Token>>;

    async fn get_token(&self, id: TokenId) -> Result<Option<Token>>;

    /// 剩余额度不少于 `amount` 时扣减并返回新值，否则返回 `None`
    async fn try_debit_token(&self, id: TokenId, amount: Quota) -> Result<Option<Quota>>;

    async fn adjust_token_quota(&self, id: TokenId, delta: Quota) -> Result<Quota>;
}

/// 渠道
#[async_trait]
pub trait ChannelRepository: Send + Sync {
    async fn load_channels(&self) -> Result<Vec<Channel>>;

    /// 持久化渠道及其密钥的状态字段
    async fn save_channel_state(&self, channel: &Channel) -> Result<()>;

    async fn adjust_channel_used_quota(&self, id: ChannelId, delta: Quota) -> Result<()>;
}

/// 订阅额度项
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// 用户当前有效的额度项，按 id 升序
    async fn active_items(&self, user_id: UserId, now: i64) -> Result<Vec<SubscriptionItem>>;

    async fn get_item(&self, item_id: SubscriptionItemId) -> Result<Option<SubscriptionItem>>;

    /// 在剩余量充足时预留 `amount`，返回是否成功
    async fn try_reserve_item(&self, item_id: SubscriptionItemId, amount: i64, now: i64)
    -> Result<bool>;

    async fn adjust_item_consumed(&self, item_id: SubscriptionItemId, delta: i64) -> Result<()>;

    /// 重置到期的额度项，返回重置条数
    async fn reset_due_items(&self, now: i64, limit: u64) -> Result<u64>;
}

/// 预扣记录
#[async_trait]
pub trait ReservationRepository: Send + Sync {
    async fn insert_reservation(&self, reservation: &Reservation) -> Result<()>;

    async fn get_reservation(&self, request_id: &str) -> Result<Option<Reservation>>;

    /// 比较并交换状态，仅当当前状态为 `from` 时生效
    async fn transition_reservation(
        &self,
        request_id: &str,
        from: ReservationState,
        to: ReservationState,
        settled_quota: Option<Quota>,
    ) -> Result<bool>;

    /// 刷新 open 记录的活动时间，记录已结算或不存在时返回 false
    async fn touch_reservation(&self, request_id: &str, at: i64) -> Result<bool>;

    /// 最近活动早于 `before` 仍处于 open 的预扣
    async fn stale_open_reservations(&self, before: i64, limit: u64) -> Result<Vec<Reservation>>;

    /// 删除创建时间早于 `before` 的非 open 记录
    async fn purge_reservations(&self, before: i64) -> Result<u64>;
}

/// 异步任务
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>>;

    async fn list_tasks(&self, user_id: UserId, task_ids: &[String]) -> Result<Vec<Task>>;

    /// 平台下未结束的任务，按提交时间升序
    async fn unfinished_tasks(&self, platform: &str, limit: u64) -> Result<Vec<Task>>;

    /// 更新非终态任务的状态与进度
    async fn update_task_progress(
        &self,
        task_id: &str,
        status: TaskStatus,
        progress: &str,
        data: Option<serde_json::Value>,
    ) -> Result<bool>;

    /// 将非终态任务转为终态，返回是否由本次调用完成转换
    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        fail_reason: Option<String>,
        finish_time: i64,
        quota: Quota,
    ) -> Result<bool>;
}

/// 消费日志
#[async_trait]
pub trait LogRepository: Send + Sync {
    async fn append_log(&self, entry: LogEntry) -> Result<()>;

    async fn logs_for_request(&self, request_id: &str) -> Result<Vec<LogEntry>>;
}

/// 全部仓储
#[derive(Clone)]
pub struct Repositories {
    pub users: Arc<dyn UserRepository>,
    pub tokens: Arc<dyn TokenRepository>,
    pub channels: Arc<dyn ChannelRepository>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub reservations: Arc<dyn ReservationRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub logs: Arc<dyn LogRepository>,
}

impl Repositories {
    /// 用同一个存储实现全部仓储
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: UserRepository
            + TokenRepository
            + ChannelRepository
            + SubscriptionRepository
            + ReservationRepository
            + TaskRepository
            + LogRepository
            + 'static,
    {
        Self {
            users: store.clone(),
            tokens: store.clone(),
            channels: store.clone(),
            subscriptions: store.clone(),
            reservations: store.clone(),
            tasks: store.clone(),
            logs: store,
        }
    }
}
