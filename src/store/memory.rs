//! # 内存存储
//!
//! 基于 `DashMap` 的仓储实现，单节点开发与测试使用。
//! 同一用户/令牌的余额变更由分片写锁串行化。

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{
    ChannelRepository, LogEntry, LogRepository, Reservation, ReservationRepository,
    ReservationState, SubscriptionItem, SubscriptionRepository, Task, TaskRepository, TaskStatus,
    Token, TokenRepository, User, UserRepository,
};
use crate::channel::Channel;
use crate::error::{RelayError, Result};
use crate::types::{ChannelId, Quota, SubscriptionItemId, TokenId, UserId};

/// 内存存储
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<UserId, User>,
    tokens: DashMap<TokenId, Token>,
    channels: DashMap<ChannelId, Channel>,
    items: DashMap<SubscriptionItemId, SubscriptionItem>,
    reservations: DashMap<String, Reservation>,
    tasks: DashMap<String, Task>,
    logs: RwLock<Vec<LogEntry>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    pub fn insert_token(&self, token: Token) {
        self.tokens.insert(token.id, token);
    }

    pub fn insert_channel(&self, channel: Channel) {
        self.channels.insert(channel.id, channel);
    }

    pub fn insert_subscription_item(&self, item: SubscriptionItem) {
        self.items.insert(item.id, item);
    }

    #[must_use]
    pub fn user_quota(&self, id: UserId) -> Option<Quota> {
        self.users.get(&id).map(|u| u.quota)
    }

    #[must_use]
    pub fn token_quota(&self, id: TokenId) -> Option<Quota> {
        self.tokens.get(&id).map(|t| t.remain_quota)
    }

    #[must_use]
    pub fn channel(&self, id: ChannelId) -> Option<Channel> {
        self.channels.get(&id).map(|c| c.clone())
    }

    #[must_use]
    pub fn subscription_item(&self, id: SubscriptionItemId) -> Option<SubscriptionItem> {
        self.items.get(&id).map(|i| i.clone())
    }

    /// 全部日志的副本
    pub async fn all_logs(&self) -> Vec<LogEntry> {
        self.logs.read().await.clone()
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn try_debit_user(&self, id: UserId, amount: Quota) -> Result<Option<Quota>> {
        let mut user = self
            .users
            .get_mut(&id)
            .ok_or_else(|| RelayError::not_found(format!("用户 {id} 不存在")))?;
        if user.quota < amount {
            return Ok(None);
        }
        user.quota -= amount;
        Ok(Some(user.quota))
    }

    async fn adjust_user_quota(&self, id: UserId, delta: Quota) -> Result<Quota> {
        let mut user = self
            .users
            .get_mut(&id)
            .ok_or_else(|| RelayError::not_found(format!("用户 {id} 不存在")))?;
        user.quota += delta;
        Ok(user.quota)
    }
}

#[async_trait]
impl TokenRepository for MemoryStore {
    async fn find_token_by_hash(&self, key_hash: &str) -> Result<Option<Token>> {
        Ok(self
            .tokens
            .iter()
            .find(|t| t.key_hash == key_hash)
            .map(|t| t.clone()))
    }

    async fn get_token(&self, id: TokenId) -> Result<Option<Token>> {
        Ok(self.tokens.get(&id).map(|t| t.clone()))
    }

    async fn try_debit_token(&self, id: TokenId, amount: Quota) -> Result<Option<Quota>> {
        let mut token = self
            .tokens
            .get_mut(&id)
            .ok_or_else(|| RelayError::not_found(format!("令牌 {id} 不存在")))?;
        if token.remain_quota < amount {
            return Ok(None);
        }
        token.remain_quota -= amount;
        Ok(Some(token.remain_quota))
    }

    async fn adjust_token_quota(&self, id: TokenId, delta: Quota) -> Result<Quota> {
        let mut token = self
            .tokens
            .get_mut(&id)
            .ok_or_else(|| RelayError::not_found(format!("令牌 {id} 不存在")))?;
        token.remain_quota += delta;
        Ok(token.remain_quota)
    }
}

#[async_trait]
impl ChannelRepository for MemoryStore {
    async fn load_channels(&self) -> Result<Vec<Channel>> {
        let mut channels: Vec<Channel> = self.channels.iter().map(|c| c.clone()).collect();
        channels.sort_by_key(|c| c.id);
        Ok(channels)
    }

    async fn save_channel_state(&self, channel: &Channel) -> Result<()> {
        if let Some(mut stored) = self.channels.get_mut(&channel.id) {
            stored.status = channel.status;
            stored.disabled_reason.clone_from(&channel.disabled_reason);
            stored.disabled_at = channel.disabled_at;
            stored.keys.clone_from(&channel.keys);
        } else {
            self.channels.insert(channel.id, channel.clone());
        }
        Ok(())
    }

    async fn adjust_channel_used_quota(&self, id: ChannelId, delta: Quota) -> Result<()> {
        if let Some(mut channel) = self.channels.get_mut(&id) {
            channel.used_quota += delta;
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionRepository for MemoryStore {
    async fn active_items(&self, user_id: UserId, now: i64) -> Result<Vec<SubscriptionItem>> {
        let mut items: Vec<SubscriptionItem> = self
            .items
            .iter()
            .filter(|i| i.user_id == user_id && i.is_active(now))
            .map(|i| i.clone())
            .collect();
        items.sort_by_key(|i| i.id);
        Ok(items)
    }

    async fn get_item(&self, item_id: SubscriptionItemId) -> Result<Option<SubscriptionItem>> {
        Ok(self.items.get(&item_id).map(|i| i.clone()))
    }

    async fn try_reserve_item(
        &self,
        item_id: SubscriptionItemId,
        amount: i64,
        now: i64,
    ) -> Result<bool> {
        let Some(mut item) = self.items.get_mut(&item_id) else {
            return Ok(false);
        };
        if !item.is_active(now) || item.remaining() < amount {
            return Ok(false);
        }
        item.consumed += amount;
        Ok(true)
    }

    async fn adjust_item_consumed(&self, item_id: SubscriptionItemId, delta: i64) -> Result<()> {
        if let Some(mut item) = self.items.get_mut(&item_id) {
            item.consumed = (item.consumed + delta).max(0);
        }
        Ok(())
    }

    async fn reset_due_items(&self, now: i64, limit: u64) -> Result<u64> {
        let due: Vec<SubscriptionItemId> = self
            .items
            .iter()
            .filter(|i| i.reset_period_secs > 0 && i.next_reset_at.is_some_and(|at| at <= now))
            .map(|i| i.id)
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect();

        let mut reset = 0;
        for id in due {
            if let Some(mut item) = self.items.get_mut(&id) {
                item.consumed = 0;
                let period = item.reset_period_secs;
                let mut next = item.next_reset_at.unwrap_or(now);
                while next <= now {
                    next += period;
                }
                item.next_reset_at = Some(next);
                reset += 1;
            }
        }
        Ok(reset)
    }
}

#[async_trait]
impl ReservationRepository for MemoryStore {
    async fn insert_reservation(&self, reservation: &Reservation) -> Result<()> {
        match self.reservations.entry(reservation.request_id.clone()) {
            Entry::Occupied(_) => Err(RelayError::database(format!(
                "预扣记录已存在: {}",
                reservation.request_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(reservation.clone());
                Ok(())
            }
        }
    }

    async fn get_reservation(&self, request_id: &str) -> Result<Option<Reservation>> {
        Ok(self.reservations.get(request_id).map(|r| r.clone()))
    }

    async fn transition_reservation(
        &self,
        request_id: &str,
        from: ReservationState,
        to: ReservationState,
        settled_quota: Option<Quota>,
    ) -> Result<bool> {
        let Some(mut reservation) = self.reservations.get_mut(request_id) else {
            return Ok(false);
        };
        if reservation.state != from {
            return Ok(false);
        }
        reservation.state = to;
        reservation.settled_quota = settled_quota;
        Ok(true)
    }

    async fn touch_reservation(&self, request_id: &str, at: i64) -> Result<bool> {
        let Some(mut reservation) = self.reservations.get_mut(request_id) else {
            return Ok(false);
        };
        if reservation.state != ReservationState::Open {
            return Ok(false);
        }
        reservation.touched_at = at;
        Ok(true)
    }

    async fn stale_open_reservations(&self, before: i64, limit: u64) -> Result<Vec<Reservation>> {
        let mut stale: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| r.state == ReservationState::Open && r.touched_at < before)
            .map(|r| r.clone())
            .collect();
        stale.sort_by_key(|r| r.touched_at);
        stale.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(stale)
    }

    async fn purge_reservations(&self, before: i64) -> Result<u64> {
        let count = self.reservations.len();
        self.reservations
            .retain(|_, r| r.state == ReservationState::Open || r.created_at >= before);
        Ok((count - self.reservations.len()) as u64)
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        self.tasks.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.get(task_id).map(|t| t.clone()))
    }

    async fn list_tasks(&self, user_id: UserId, task_ids: &[String]) -> Result<Vec<Task>> {
        Ok(task_ids
            .iter()
            .filter_map(|id| self.tasks.get(id).map(|t| t.clone()))
            .filter(|t| t.user_id == user_id)
            .collect())
    }

    async fn unfinished_tasks(&self, platform: &str, limit: u64) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| t.platform == platform && !t.status.is_terminal())
            .map(|t| t.clone())
            .collect();
        tasks.sort_by_key(|t| t.submit_time);
        tasks.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(tasks)
    }

    async fn update_task_progress(
        &self,
        task_id: &str,
        status: TaskStatus,
        progress: &str,
        data: Option<serde_json::Value>,
    ) -> Result<bool> {
        let Some(mut task) = self.tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if task.status.is_terminal() {
            return Ok(false);
        }
        task.status = status;
        task.progress = progress.to_string();
        if let Some(data) = data {
            task.data = data;
        }
        Ok(true)
    }

    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        fail_reason: Option<String>,
        finish_time: i64,
        quota: Quota,
    ) -> Result<bool> {
        let Some(mut task) = self.tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if task.status.is_terminal() {
            return Ok(false);
        }
        task.status = status;
        task.fail_reason = fail_reason;
        task.finish_time = Some(finish_time);
        task.quota = quota;
        task.progress = "100%".to_string();
        Ok(true)
    }
}

#[async_trait]
impl LogRepository for MemoryStore {
    async fn append_log(&self, entry: LogEntry) -> Result<()> {
        self.logs.write().await.push(entry);
        Ok(())
    }

    async fn logs_for_request(&self, request_id: &str) -> Result<Vec<LogEntry>> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .filter(|l| l.request_id == request_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountStatus, BillingPreference, BillingSource};

    fn user(quota: Quota) -> User {
        User {
            id: 1,
            email: "a@example.com".into(),
            group: "default".into(),
            quota,
            status: AccountStatus::Enabled,
            billing_preference: BillingPreference::WalletFirst,
            warning_threshold: 0,
        }
    }

    #[tokio::test]
    async fn test_conditional_debit() {
        let store = MemoryStore::new();
        store.insert_user(user(100));
        assert_eq!(store.try_debit_user(1, 60).await.unwrap(), Some(40));
        assert_eq!(store.try_debit_user(1, 60).await.unwrap(), None);
        assert_eq!(store.adjust_user_quota(1, -50).await.unwrap(), -10);
    }

    #[tokio::test]
    async fn test_concurrent_debits_never_overdraw() {
        let store = MemoryStore::new();
        store.insert_user(user(1_000));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.try_debit_user(1, 30).await.unwrap() })
            })
            .collect();
        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                ok += 1;
            }
        }
        assert_eq!(ok, 33);
        assert_eq!(store.user_quota(1), Some(10));
    }

    #[tokio::test]
    async fn test_reservation_cas() {
        let store = MemoryStore::new();
        let reservation = Reservation {
            request_id: "req-1".into(),
            user_id: 1,
            token_id: 1,
            channel_id: None,
            model: "gpt-4o".into(),
            source: BillingSource::Wallet,
            amount: 10,
            token_amount: 10,
            quota: 10,
            state: ReservationState::Open,
            settled_quota: None,
            created_at: 0,
            touched_at: 0,
        };
        store.insert_reservation(&reservation).await.unwrap();
        assert!(store.insert_reservation(&reservation).await.is_err());

        let first = store
            .transition_reservation("req-1", ReservationState::Open, ReservationState::Settled, Some(7))
            .await
            .unwrap();
        let second = store
            .transition_reservation("req-1", ReservationState::Open, ReservationState::Refunded, None)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn test_reset_due_items_advances_schedule() {
        let store = MemoryStore::new();
        store.insert_subscription_item(SubscriptionItem {
            id: 5,
            user_id: 1,
            plan_id: 1,
            quota_type: crate::store::QuotaType::PerCall,
            total: 10,
            consumed: 10,
            reset_period_secs: 100,
            next_reset_at: Some(50),
            expires_at: None,
        });
        assert_eq!(store.reset_due_items(260, 300).await.unwrap(), 1);
        let item = store.subscription_item(5).unwrap();
        assert_eq!(item.consumed, 0);
        assert_eq!(item.next_reset_at, Some(350));
    }
}
