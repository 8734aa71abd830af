//! # 数据库存储
//!
//! 基于 Sea-ORM 的仓储实现。余额与额度项的扣减使用带条件的单条 UPDATE，
//! 通过 `rows_affected` 判断是否成功，不在应用层加锁。

use async_trait::async_trait;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, NotSet,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};

use super::{
    ChannelRepository, LogEntry, LogKind, LogRepository, QuotaType, Reservation,
    ReservationRepository, ReservationState, SubscriptionItem, SubscriptionRepository, Task,
    TaskRepository, TaskStatus, Token, TokenRepository, User, UserRepository,
};
use crate::channel::{Channel, ChannelStatus};
use crate::error::{RelayError, Result};
use crate::types::{
    AccountStatus, BillingSource, ChannelId, Quota, SubscriptionItemId,
    TokenId, UserId, month_partition, now_timestamp,
};
use entity::{channels, consumption_logs, reservations, subscription_items, tasks, tokens, users};

/// 数据库存储
#[derive(Clone)]
pub struct DatabaseStore {
    db: DatabaseConnection,
}

impl DatabaseStore {
    #[must_use]
    pub const fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    #[must_use]
    pub const fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn parse_status(s: &str) -> AccountStatus {
    if s == "disabled" {
        AccountStatus::Disabled
    } else {
        AccountStatus::Enabled
    }
}

const fn status_str(status: AccountStatus) -> &'static str {
    match status {
        AccountStatus::Enabled => "enabled",
        AccountStatus::Disabled => "disabled",
    }
}

fn source_of(kind: &str, item_id: Option<i64>) -> BillingSource {
    match (kind, item_id) {
        ("subscription", Some(item_id)) => BillingSource::Subscription { item_id },
        _ => BillingSource::Wallet,
    }
}

fn user_from(model: users::Model) -> User {
    User {
        id: model.id,
        email: model.email,
        group: model.group_name,
        quota: model.quota,
        status: parse_status(&model.status),
        billing_preference: model.billing_preference.parse().unwrap_or_default(),
        warning_threshold: model.warning_threshold,
    }
}

fn token_from(model: tokens::Model) -> Token {
    Token {
        id: model.id,
        user_id: model.user_id,
        name: model.name,
        key_hash: model.key_hash,
        remain_quota: model.remain_quota,
        unlimited: model.unlimited,
        allowed_groups: serde_json::from_str(&model.allowed_groups).unwrap_or_default(),
        allowed_models: serde_json::from_str(&model.allowed_models).unwrap_or_default(),
        expires_at: model.expires_at,
        status: parse_status(&model.status),
    }
}

fn channel_from(model: channels::Model) -> Result<Channel> {
    let provider = model
        .provider
        .parse()
        .map_err(|e: String| RelayError::database(format!("渠道 {} 配置无效: {e}", model.id)))?;
    Ok(Channel {
        id: model.id,
        name: model.name,
        provider,
        base_url: model.base_url,
        keys: serde_json::from_str(&model.keys)?,
        models: serde_json::from_str(&model.models)?,
        model_mapping: serde_json::from_str(&model.model_mapping).unwrap_or_default(),
        groups: serde_json::from_str(&model.groups)?,
        model_caps: serde_json::from_str(&model.model_caps).unwrap_or_default(),
        daily_request_budget: model.daily_request_budget,
        priority: model.priority,
        weight: u32::try_from(model.weight).unwrap_or(0),
        status: ChannelStatus::parse(&model.status),
        disabled_reason: model.disabled_reason,
        disabled_at: model.disabled_at,
        used_quota: model.used_quota,
        header_overrides: serde_json::from_str(&model.header_overrides).unwrap_or_default(),
        other: serde_json::from_str(&model.other).unwrap_or_default(),
    })
}

fn item_from(model: subscription_items::Model) -> SubscriptionItem {
    SubscriptionItem {
        id: model.id,
        user_id: model.user_id,
        plan_id: model.plan_id,
        quota_type: QuotaType::parse(&model.quota_type),
        total: model.total,
        consumed: model.consumed,
        reset_period_secs: model.reset_period_secs,
        next_reset_at: model.next_reset_at,
        expires_at: model.expires_at,
    }
}

fn reservation_from(model: reservations::Model) -> Reservation {
    Reservation {
        request_id: model.request_id,
        user_id: model.user_id,
        token_id: model.token_id,
        channel_id: model.channel_id,
        model: model.model,
        source: source_of(&model.source, model.subscription_item_id),
        amount: model.amount,
        token_amount: model.token_amount,
        quota: model.quota,
        state: ReservationState::parse(&model.state),
        settled_quota: model.settled_quota,
        created_at: model.created_at,
        touched_at: model.updated_at,
    }
}

fn task_from(model: tasks::Model) -> Result<Task> {
    Ok(Task {
        task_id: model.task_id,
        upstream_task_id: model.upstream_task_id,
        platform: model.platform,
        request_id: model.request_id,
        user_id: model.user_id,
        token_id: model.token_id,
        channel_id: model.channel_id,
        action: model.action,
        model: model.model,
        status: TaskStatus::parse(&model.status).unwrap_or(TaskStatus::Submitted),
        progress: model.progress,
        fail_reason: model.fail_reason,
        quota: model.quota,
        billing_source: source_of(&model.billing_source, model.subscription_item_id),
        submit_time: model.submit_time,
        finish_time: model.finish_time,
        data: serde_json::from_str(&model.data).unwrap_or_default(),
        billing_snapshot: serde_json::from_str(&model.billing_snapshot)?,
    })
}

fn log_from(model: consumption_logs::Model) -> LogEntry {
    LogEntry {
        kind: LogKind::parse(&model.kind),
        request_id: model.request_id,
        user_id: model.user_id,
        token_id: model.token_id,
        channel_id: model.channel_id,
        model: model.model,
        quota: model.quota,
        prompt_tokens: model.prompt_tokens,
        completion_tokens: model.completion_tokens,
        content: model.content,
        created_at: model.created_at,
    }
}

impl DatabaseStore {
    /// 写入用户（初始化数据与测试使用）
    pub async fn insert_user(&self, user: &User) -> Result<()> {
        users::ActiveModel {
            id: Set(user.id),
            email: Set(user.email.clone()),
            group_name: Set(user.group.clone()),
            quota: Set(user.quota),
            status: Set(status_str(user.status).to_string()),
            billing_preference: Set(user.billing_preference.as_str().to_string()),
            warning_threshold: Set(user.warning_threshold),
            created_at: Set(now_timestamp()),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    /// 写入令牌
    pub async fn insert_token(&self, token: &Token) -> Result<()> {
        tokens::ActiveModel {
            id: Set(token.id),
            user_id: Set(token.user_id),
            name: Set(token.name.clone()),
            key_hash: Set(token.key_hash.clone()),
            remain_quota: Set(token.remain_quota),
            unlimited: Set(token.unlimited),
            allowed_groups: Set(serde_json::to_string(&token.allowed_groups)?),
            allowed_models: Set(serde_json::to_string(&token.allowed_models)?),
            expires_at: Set(token.expires_at),
            status: Set(status_str(token.status).to_string()),
            created_at: Set(now_timestamp()),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    /// 写入渠道
    pub async fn insert_channel(&self, channel: &Channel) -> Result<()> {
        channels::ActiveModel {
            id: Set(channel.id),
            name: Set(channel.name.clone()),
            provider: Set(channel.provider.as_str().to_string()),
            base_url: Set(channel.base_url.clone()),
            keys: Set(serde_json::to_string(&channel.keys)?),
            models: Set(serde_json::to_string(&channel.models)?),
            model_mapping: Set(serde_json::to_string(&channel.model_mapping)?),
            groups: Set(serde_json::to_string(&channel.groups)?),
            model_caps: Set(serde_json::to_string(&channel.model_caps)?),
            daily_request_budget: Set(channel.daily_request_budget),
            priority: Set(channel.priority),
            weight: Set(i32::try_from(channel.weight).unwrap_or(i32::MAX)),
            status: Set(channel.status.as_str().to_string()),
            disabled_reason: Set(channel.disabled_reason.clone()),
            disabled_at: Set(channel.disabled_at),
            used_quota: Set(channel.used_quota),
            header_overrides: Set(serde_json::to_string(&channel.header_overrides)?),
            other: Set(channel.other.to_string()),
            updated_at: Set(now_timestamp()),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    /// 写入订阅额度项
    pub async fn insert_subscription_item(&self, item: &SubscriptionItem) -> Result<()> {
        subscription_items::ActiveModel {
            id: Set(item.id),
            user_id: Set(item.user_id),
            plan_id: Set(item.plan_id),
            quota_type: Set(item.quota_type.as_str().to_string()),
            total: Set(item.total),
            consumed: Set(item.consumed),
            reset_period_secs: Set(item.reset_period_secs),
            next_reset_at: Set(item.next_reset_at),
            expires_at: Set(item.expires_at),
            created_at: Set(now_timestamp()),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UserRepository for DatabaseStore {
    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(users::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .map(user_from))
    }

    async fn try_debit_user(&self, id: UserId, amount: Quota) -> Result<Option<Quota>> {
        let result = users::Entity::update_many()
            .col_expr(users::Column::Quota, Expr::col(users::Column::Quota).sub(amount))
            .filter(users::Column::Id.eq(id))
            .filter(users::Column::Quota.gte(amount))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Ok(None);
        }
        Ok(self.get_user(id).await?.map(|u| u.quota))
    }

    async fn adjust_user_quota(&self, id: UserId, delta: Quota) -> Result<Quota> {
        let result = users::Entity::update_many()
            .col_expr(users::Column::Quota, Expr::col(users::Column::Quota).add(delta))
            .filter(users::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(RelayError::not_found(format!("用户 {id} 不存在")));
        }
        Ok(self.get_user(id).await?.map_or(0, |u| u.quota))
    }
}

#[async_trait]
impl TokenRepository for DatabaseStore {
    async fn find_token_by_hash(&self, key_hash: &str) -> Result<Option<Token>> {
        Ok(tokens::Entity::find()
            .filter(tokens::Column::KeyHash.eq(key_hash))
            .one(&self.db)
            .await?
            .map(token_from))
    }

    async fn get_token(&self, id: TokenId) -> Result<Option<Token>> {
        Ok(tokens::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .map(token_from))
    }

    async fn try_debit_token(&self, id: TokenId, amount: Quota) -> Result<Option<Quota>> {
        let result = tokens::Entity::update_many()
            .col_expr(
                tokens::Column::RemainQuota,
                Expr::col(tokens::Column::RemainQuota).sub(amount),
            )
            .filter(tokens::Column::Id.eq(id))
            .filter(tokens::Column::RemainQuota.gte(amount))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Ok(None);
        }
        Ok(self.get_token(id).await?.map(|t| t.remain_quota))
    }

    async fn adjust_token_quota(&self, id: TokenId, delta: Quota) -> Result<Quota> {
        let result = tokens::Entity::update_many()
            .col_expr(
                tokens::Column::RemainQuota,
                Expr::col(tokens::Column::RemainQuota).add(delta),
            )
            .filter(tokens::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(RelayError::not_found(format!("令牌 {id} 不存在")));
        }
        Ok(self.get_token(id).await?.map_or(0, |t| t.remain_quota))
    }
}

#[async_trait]
impl ChannelRepository for DatabaseStore {
    async fn load_channels(&self) -> Result<Vec<Channel>> {
        channels::Entity::find()
            .order_by_asc(channels::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(channel_from)
            .collect()
    }

    async fn save_channel_state(&self, channel: &Channel) -> Result<()> {
        let update = channels::ActiveModel {
            keys: Set(serde_json::to_string(&channel.keys)?),
            status: Set(channel.status.as_str().to_string()),
            disabled_reason: Set(channel.disabled_reason.clone()),
            disabled_at: Set(channel.disabled_at),
            updated_at: Set(now_timestamp()),
            ..Default::default()
        };
        channels::Entity::update_many()
            .set(update)
            .filter(channels::Column::Id.eq(channel.id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn adjust_channel_used_quota(&self, id: ChannelId, delta: Quota) -> Result<()> {
        channels::Entity::update_many()
            .col_expr(
                channels::Column::UsedQuota,
                Expr::col(channels::Column::UsedQuota).add(delta),
            )
            .filter(channels::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

fn active_at(now: i64) -> Condition {
    Condition::any()
        .add(subscription_items::Column::ExpiresAt.is_null())
        .add(subscription_items::Column::ExpiresAt.gt(now))
}

#[async_trait]
impl SubscriptionRepository for DatabaseStore {
    async fn active_items(&self, user_id: UserId, now: i64) -> Result<Vec<SubscriptionItem>> {
        Ok(subscription_items::Entity::find()
            .filter(subscription_items::Column::UserId.eq(user_id))
            .filter(active_at(now))
            .order_by_asc(subscription_items::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(item_from)
            .collect())
    }

    async fn get_item(&self, item_id: SubscriptionItemId) -> Result<Option<SubscriptionItem>> {
        Ok(subscription_items::Entity::find_by_id(item_id)
            .one(&self.db)
            .await?
            .map(item_from))
    }

    async fn try_reserve_item(
        &self,
        item_id: SubscriptionItemId,
        amount: i64,
        now: i64,
    ) -> Result<bool> {
        use subscription_items::Column;

        let txn = self.db.begin().await?;
        let result = subscription_items::Entity::update_many()
            .col_expr(Column::Consumed, Expr::col(Column::Consumed).add(amount))
            .filter(Column::Id.eq(item_id))
            .filter(active_at(now))
            .filter(Expr::expr(Expr::col(Column::Total).sub(Expr::col(Column::Consumed))).gte(amount))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(result.rows_affected > 0)
    }

    async fn adjust_item_consumed(&self, item_id: SubscriptionItemId, delta: i64) -> Result<()> {
        use subscription_items::Column;

        subscription_items::Entity::update_many()
            .col_expr(Column::Consumed, Expr::col(Column::Consumed).add(delta))
            .filter(Column::Id.eq(item_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn reset_due_items(&self, now: i64, limit: u64) -> Result<u64> {
        use subscription_items::Column;

        let due = subscription_items::Entity::find()
            .filter(Column::ResetPeriodSecs.gt(0))
            .filter(Column::NextResetAt.lte(now))
            .order_by_asc(Column::NextResetAt)
            .limit(limit)
            .all(&self.db)
            .await?;

        let mut reset = 0;
        let txn = self.db.begin().await?;
        for item in due {
            let period = item.reset_period_secs;
            let mut next = item.next_reset_at.unwrap_or(now);
            while next <= now {
                next += period;
            }
            let result = subscription_items::Entity::update_many()
                .col_expr(Column::Consumed, Expr::value(0_i64))
                .col_expr(Column::NextResetAt, Expr::value(Some(next)))
                .filter(Column::Id.eq(item.id))
                .filter(Column::NextResetAt.eq(item.next_reset_at))
                .exec(&txn)
                .await?;
            reset += result.rows_affected;
        }
        txn.commit().await?;
        Ok(reset)
    }
}

#[async_trait]
impl ReservationRepository for DatabaseStore {
    async fn insert_reservation(&self, reservation: &Reservation) -> Result<()> {
        reservations::ActiveModel {
            id: NotSet,
            request_id: Set(reservation.request_id.clone()),
            user_id: Set(reservation.user_id),
            token_id: Set(reservation.token_id),
            channel_id: Set(reservation.channel_id),
            model: Set(reservation.model.clone()),
            source: Set(reservation.source.as_str().to_string()),
            subscription_item_id: Set(reservation.source.subscription_item()),
            amount: Set(reservation.amount),
            token_amount: Set(reservation.token_amount),
            quota: Set(reservation.quota),
            state: Set(reservation.state.as_str().to_string()),
            settled_quota: Set(reservation.settled_quota),
            created_at: Set(reservation.created_at),
            updated_at: Set(reservation.touched_at),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    async fn get_reservation(&self, request_id: &str) -> Result<Option<Reservation>> {
        Ok(reservations::Entity::find()
            .filter(reservations::Column::RequestId.eq(request_id))
            .one(&self.db)
            .await?
            .map(reservation_from))
    }

    async fn transition_reservation(
        &self,
        request_id: &str,
        from: ReservationState,
        to: ReservationState,
        settled_quota: Option<Quota>,
    ) -> Result<bool> {
        use reservations::Column;

        let result = reservations::Entity::update_many()
            .col_expr(Column::State, Expr::value(to.as_str()))
            .col_expr(Column::SettledQuota, Expr::value(settled_quota))
            .col_expr(Column::UpdatedAt, Expr::value(now_timestamp()))
            .filter(Column::RequestId.eq(request_id))
            .filter(Column::State.eq(from.as_str()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn touch_reservation(&self, request_id: &str, at: i64) -> Result<bool> {
        use reservations::Column;

        let result = reservations::Entity::update_many()
            .col_expr(Column::UpdatedAt, Expr::value(at))
            .filter(Column::RequestId.eq(request_id))
            .filter(Column::State.eq(ReservationState::Open.as_str()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn stale_open_reservations(&self, before: i64, limit: u64) -> Result<Vec<Reservation>> {
        use reservations::Column;

        Ok(reservations::Entity::find()
            .filter(Column::State.eq(ReservationState::Open.as_str()))
            .filter(Column::UpdatedAt.lt(before))
            .order_by_asc(Column::UpdatedAt)
            .limit(limit)
            .all(&self.db)
            .await?
            .into_iter()
            .map(reservation_from)
            .collect())
    }

    async fn purge_reservations(&self, before: i64) -> Result<u64> {
        use reservations::Column;

        let result = reservations::Entity::delete_many()
            .filter(Column::State.ne(ReservationState::Open.as_str()))
            .filter(Column::CreatedAt.lt(before))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

#[async_trait]
impl TaskRepository for DatabaseStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        tasks::ActiveModel {
            id: NotSet,
            task_id: Set(task.task_id.clone()),
            upstream_task_id: Set(task.upstream_task_id.clone()),
            platform: Set(task.platform.clone()),
            request_id: Set(task.request_id.clone()),
            user_id: Set(task.user_id),
            token_id: Set(task.token_id),
            channel_id: Set(task.channel_id),
            action: Set(task.action.clone()),
            model: Set(task.model.clone()),
            status: Set(task.status.as_str().to_string()),
            progress: Set(task.progress.clone()),
            fail_reason: Set(task.fail_reason.clone()),
            quota: Set(task.quota),
            billing_source: Set(task.billing_source.as_str().to_string()),
            subscription_item_id: Set(task.billing_source.subscription_item()),
            submit_time: Set(task.submit_time),
            finish_time: Set(task.finish_time),
            data: Set(task.data.to_string()),
            billing_snapshot: Set(serde_json::to_string(&task.billing_snapshot)?),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        tasks::Entity::find()
            .filter(tasks::Column::TaskId.eq(task_id))
            .one(&self.db)
            .await?
            .map(task_from)
            .transpose()
    }

    async fn list_tasks(&self, user_id: UserId, task_ids: &[String]) -> Result<Vec<Task>> {
        tasks::Entity::find()
            .filter(tasks::Column::UserId.eq(user_id))
            .filter(tasks::Column::TaskId.is_in(task_ids.iter().cloned()))
            .all(&self.db)
            .await?
            .into_iter()
            .map(task_from)
            .collect()
    }

    async fn unfinished_tasks(&self, platform: &str, limit: u64) -> Result<Vec<Task>> {
        tasks::Entity::find()
            .filter(tasks::Column::Platform.eq(platform))
            .filter(tasks::Column::Status.is_not_in([
                TaskStatus::Success.as_str(),
                TaskStatus::Failure.as_str(),
            ]))
            .order_by_asc(tasks::Column::SubmitTime)
            .limit(limit)
            .all(&self.db)
            .await?
            .into_iter()
            .map(task_from)
            .collect()
    }

    async fn update_task_progress(
        &self,
        task_id: &str,
        status: TaskStatus,
        progress: &str,
        data: Option<serde_json::Value>,
    ) -> Result<bool> {
        let mut update = tasks::ActiveModel {
            status: Set(status.as_str().to_string()),
            progress: Set(progress.to_string()),
            ..Default::default()
        };
        if let Some(data) = data {
            update.data = Set(data.to_string());
        }
        let result = tasks::Entity::update_many()
            .set(update)
            .filter(tasks::Column::TaskId.eq(task_id))
            .filter(tasks::Column::Status.is_not_in([
                TaskStatus::Success.as_str(),
                TaskStatus::Failure.as_str(),
            ]))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        fail_reason: Option<String>,
        finish_time: i64,
        quota: Quota,
    ) -> Result<bool> {
        let update = tasks::ActiveModel {
            status: Set(status.as_str().to_string()),
            fail_reason: Set(fail_reason),
            finish_time: Set(Some(finish_time)),
            quota: Set(quota),
            progress: Set("100%".to_string()),
            ..Default::default()
        };
        let result = tasks::Entity::update_many()
            .set(update)
            .filter(tasks::Column::TaskId.eq(task_id))
            .filter(tasks::Column::Status.is_not_in([
                TaskStatus::Success.as_str(),
                TaskStatus::Failure.as_str(),
            ]))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }
}

#[async_trait]
impl LogRepository for DatabaseStore {
    async fn append_log(&self, entry: LogEntry) -> Result<()> {
        let partition = chrono::DateTime::from_timestamp(entry.created_at, 0)
            .map(month_partition)
            .unwrap_or_default();
        consumption_logs::ActiveModel {
            id: NotSet,
            kind: Set(entry.kind.as_str().to_string()),
            request_id: Set(entry.request_id),
            user_id: Set(entry.user_id),
            token_id: Set(entry.token_id),
            channel_id: Set(entry.channel_id),
            model: Set(entry.model),
            quota: Set(entry.quota),
            prompt_tokens: Set(entry.prompt_tokens),
            completion_tokens: Set(entry.completion_tokens),
            content: Set(entry.content),
            partition: Set(partition),
            created_at: Set(entry.created_at),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    async fn logs_for_request(&self, request_id: &str) -> Result<Vec<LogEntry>> {
        Ok(consumption_logs::Entity::find()
            .filter(consumption_logs::Column::RequestId.eq(request_id))
            .order_by_asc(consumption_logs::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(log_from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{connect, create_tables};
    use crate::types::BillingPreference;

    async fn store() -> DatabaseStore {
        let db = connect("sqlite::memory:").await.unwrap();
        create_tables(&db).await.unwrap();
        DatabaseStore::new(db)
    }

    fn user(quota: Quota) -> User {
        User {
            id: 1,
            email: "ops@example.com".into(),
            group: "default".into(),
            quota,
            status: AccountStatus::Enabled,
            billing_preference: BillingPreference::SubscriptionFirst,
            warning_threshold: 0,
        }
    }

    #[tokio::test]
    async fn test_conditional_debit_in_sql() {
        let store = store().await;
        store.insert_user(&user(100)).await.unwrap();

        assert_eq!(store.try_debit_user(1, 70).await.unwrap(), Some(30));
        assert_eq!(store.try_debit_user(1, 70).await.unwrap(), None);
        assert_eq!(store.adjust_user_quota(1, -40).await.unwrap(), -10);
    }

    #[tokio::test]
    async fn test_subscription_reserve_respects_remaining() {
        let store = store().await;
        store
            .insert_subscription_item(&SubscriptionItem {
                id: 9,
                user_id: 1,
                plan_id: 1,
                quota_type: QuotaType::Quota,
                total: 500,
                consumed: 400,
                reset_period_secs: 0,
                next_reset_at: None,
                expires_at: None,
            })
            .await
            .unwrap();

        assert!(!store.try_reserve_item(9, 200, 0).await.unwrap());
        assert!(store.try_reserve_item(9, 100, 0).await.unwrap());
        assert!(!store.try_reserve_item(9, 1, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_reservation_transition_once() {
        let store = store().await;
        let reservation = Reservation {
            request_id: "req-db".into(),
            user_id: 1,
            token_id: 2,
            channel_id: Some(3),
            model: "gpt-4o".into(),
            source: BillingSource::Subscription { item_id: 4 },
            amount: 1,
            token_amount: 200,
            quota: 200,
            state: ReservationState::Open,
            settled_quota: None,
            created_at: 10,
            touched_at: 10,
        };
        store.insert_reservation(&reservation).await.unwrap();
        let loaded = store.get_reservation("req-db").await.unwrap().unwrap();
        assert_eq!(loaded, reservation);

        assert!(store
            .transition_reservation("req-db", ReservationState::Open, ReservationState::Settled, Some(150))
            .await
            .unwrap());
        assert!(!store
            .transition_reservation("req-db", ReservationState::Open, ReservationState::Refunded, None)
            .await
            .unwrap());
    }
}
