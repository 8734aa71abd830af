//! # 计费引擎
//!
//! 预扣、结算与退还。预扣记录的状态迁移（open → settled / refunded）
//! 由仓储以比较并交换完成，同一请求只会结算或退还一次。

use std::sync::Arc;

use super::source::reserve_from_source;
use crate::error::{RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::store::{LogEntry, LogKind, QuotaType, Repositories, Reservation, ReservationState};
use crate::types::{BillingSource, ChannelId, Quota, TokenId, Usage, UserId, now_timestamp};
use crate::{ldebug, linfo, lwarn};

/// 预扣参数
#[derive(Debug, Clone)]
pub struct PreConsumeRequest<'a> {
    pub request_id: &'a str,
    pub user_id: UserId,
    pub token_id: TokenId,
    pub channel_id: Option<ChannelId>,
    pub model: &'a str,
    pub quota: Quota,
}

/// 结算参数
#[derive(Debug, Clone, Default)]
pub struct Settlement {
    /// 实际额度
    pub quota: Quota,
    pub usage: Usage,
    /// 最终服务请求的渠道
    pub channel_id: Option<ChannelId>,
    pub model: String,
    pub content: String,
}

fn clamp_tokens(tokens: u64) -> i64 {
    i64::try_from(tokens).unwrap_or(i64::MAX)
}

/// 计费引擎
#[derive(Clone)]
pub struct BillingEngine {
    repos: Repositories,
}

impl BillingEngine {
    #[must_use]
    pub const fn new(repos: Repositories) -> Self {
        Self { repos }
    }

    #[must_use]
    pub const fn repositories(&self) -> &Repositories {
        &self.repos
    }

    /// 派发前预扣
    ///
    /// 先扣令牌再扣来源，任一步失败都会回滚已扣部分。
    pub async fn pre_consume(&self, request: &PreConsumeRequest<'_>) -> Result<Reservation> {
        let rid = request.request_id;
        let user = self
            .repos
            .users
            .get_user(request.user_id)
            .await?
            .ok_or_else(|| RelayError::auth("用户不存在"))?;
        if !user.status.is_enabled() {
            return Err(RelayError::auth("用户已被禁用"));
        }
        let token = self
            .repos
            .tokens
            .get_token(request.token_id)
            .await?
            .ok_or_else(|| RelayError::auth("令牌不存在"))?;

        let quota = request.quota.max(0);
        let token_amount = if token.unlimited { 0 } else { quota };
        if token_amount > 0
            && self
                .repos
                .tokens
                .try_debit_token(token.id, token_amount)
                .await?
                .is_none()
        {
            return Err(RelayError::pre_consume("令牌额度不足"));
        }

        let now = now_timestamp();
        let reserved = match reserve_from_source(&self.repos, &user, quota, now).await {
            Ok(reserved) => reserved,
            Err(e) => {
                self.revert_token(rid, token.id, token_amount).await;
                return Err(e);
            }
        };

        if let Some(balance) = reserved.wallet_balance {
            warn_on_threshold(rid, user.id, balance, reserved.amount, user.warning_threshold);
        }

        let reservation = Reservation {
            request_id: rid.to_string(),
            user_id: user.id,
            token_id: token.id,
            channel_id: request.channel_id,
            model: request.model.to_string(),
            source: reserved.source,
            amount: reserved.amount,
            token_amount,
            quota,
            state: ReservationState::Open,
            settled_quota: None,
            created_at: now,
            touched_at: now,
        };
        if let Err(e) = self.repos.reservations.insert_reservation(&reservation).await {
            self.revert_source(rid, &reservation, reservation.amount).await;
            self.revert_token(rid, token.id, token_amount).await;
            return Err(e);
        }

        ldebug!(
            rid,
            LogStage::Billing,
            LogComponent::Billing,
            "pre_consume",
            "预扣完成",
            user_id = user.id,
            token_id = token.id,
            quota = quota,
            source = reserved.source.as_str(),
            amount = reserved.amount
        );
        Ok(reservation)
    }

    /// 按实际额度结算，返回本次调用是否完成了结算
    pub async fn post_consume(&self, request_id: &str, settlement: &Settlement) -> Result<bool> {
        let reservation = self
            .repos
            .reservations
            .get_reservation(request_id)
            .await?
            .ok_or_else(|| RelayError::not_found(format!("预扣记录不存在: {request_id}")))?;
        let actual = settlement.quota.max(0);
        if !self
            .repos
            .reservations
            .transition_reservation(
                request_id,
                ReservationState::Open,
                ReservationState::Settled,
                Some(actual),
            )
            .await?
        {
            ldebug!(
                request_id,
                LogStage::Billing,
                LogComponent::Billing,
                "post_consume_skip",
                "预扣记录已结算或已退还",
                state = reservation.state.as_str()
            );
            return Ok(false);
        }

        let delta = actual - reservation.quota;
        match reservation.source {
            BillingSource::Wallet => {
                if delta != 0 {
                    let balance = self.repos.users.adjust_user_quota(reservation.user_id, -delta).await?;
                    if delta > 0 {
                        let threshold = self
                            .repos
                            .users
                            .get_user(reservation.user_id)
                            .await?
                            .map_or(0, |u| u.warning_threshold);
                        warn_on_threshold(request_id, reservation.user_id, balance, delta, threshold);
                    }
                }
            }
            BillingSource::Subscription { item_id } => {
                let quota_item = self
                    .repos
                    .subscriptions
                    .get_item(item_id)
                    .await?
                    .is_some_and(|item| item.quota_type == QuotaType::Quota);
                let item_delta = actual - reservation.amount;
                if quota_item && item_delta != 0 {
                    self.repos.subscriptions.adjust_item_consumed(item_id, item_delta).await?;
                }
            }
        }

        self.settle_token(&reservation, actual).await?;

        let channel_id = settlement.channel_id.or(reservation.channel_id);
        if let Some(channel_id) = channel_id
            && actual != 0
        {
            self.repos.channels.adjust_channel_used_quota(channel_id, actual).await?;
        }

        let mut entry = LogEntry::new(LogKind::Consume, request_id, reservation.user_id);
        entry.token_id = Some(reservation.token_id);
        entry.channel_id = channel_id;
        entry.model = if settlement.model.is_empty() {
            reservation.model.clone()
        } else {
            settlement.model.clone()
        };
        entry.quota = actual;
        entry.prompt_tokens = clamp_tokens(settlement.usage.prompt_tokens);
        entry.completion_tokens = clamp_tokens(settlement.usage.completion_tokens);
        entry.content.clone_from(&settlement.content);
        self.repos.logs.append_log(entry).await?;

        linfo!(
            request_id,
            LogStage::Billing,
            LogComponent::Billing,
            "post_consume",
            "结算完成",
            user_id = reservation.user_id,
            pre_consumed = reservation.quota,
            actual = actual,
            delta = delta
        );
        Ok(true)
    }

    /// 刷新仍在进行中的预扣，避免被对账任务当作遗留记录退还
    pub async fn touch(&self, request_id: &str) -> Result<bool> {
        self.repos
            .reservations
            .touch_reservation(request_id, now_timestamp())
            .await
    }

    /// 退还预扣或已结算的额度，返回本次调用是否完成了退还
    ///
    /// 已结算的记录按结算额退还，并同步扣减渠道已用额度。
    pub async fn refund(&self, request_id: &str, reason: &str) -> Result<bool> {
        let Some(reservation) = self.repos.reservations.get_reservation(request_id).await? else {
            return Ok(false);
        };
        let (from, refunded, source_amount) = match reservation.state {
            ReservationState::Open => (ReservationState::Open, reservation.quota, reservation.amount),
            ReservationState::Settled => {
                let settled = reservation.settled_quota.unwrap_or(reservation.quota);
                (ReservationState::Settled, settled, self.settled_source_amount(&reservation, settled).await?)
            }
            ReservationState::Refunded => return Ok(false),
        };
        if !self
            .repos
            .reservations
            .transition_reservation(request_id, from, ReservationState::Refunded, reservation.settled_quota)
            .await?
        {
            return Ok(false);
        }

        self.revert_source(request_id, &reservation, source_amount).await;
        let token_amount = if from == ReservationState::Open {
            reservation.token_amount
        } else {
            self.token_charge(&reservation, refunded).await?
        };
        self.revert_token(request_id, reservation.token_id, token_amount).await;
        if from == ReservationState::Settled
            && refunded != 0
            && let Some(channel_id) = reservation.channel_id
        {
            self.repos
                .channels
                .adjust_channel_used_quota(channel_id, -refunded)
                .await?;
        }

        let mut entry = LogEntry::new(LogKind::Refund, request_id, reservation.user_id);
        entry.token_id = Some(reservation.token_id);
        entry.channel_id = reservation.channel_id;
        entry.model.clone_from(&reservation.model);
        entry.quota = refunded;
        entry.content = reason.to_string();
        self.repos.logs.append_log(entry).await?;

        linfo!(
            request_id,
            LogStage::Billing,
            LogComponent::Billing,
            "refund",
            "额度已退还",
            user_id = reservation.user_id,
            quota = refunded,
            reason = reason
        );
        Ok(true)
    }

    /// 调整已结算记录的额度，用于异步任务完成后按实际用量重算
    pub async fn adjust_settled(&self, request_id: &str, actual: Quota, content: &str) -> Result<bool> {
        let Some(reservation) = self.repos.reservations.get_reservation(request_id).await? else {
            return Ok(false);
        };
        if reservation.state != ReservationState::Settled {
            return Ok(false);
        }
        let settled = reservation.settled_quota.unwrap_or(reservation.quota);
        let actual = actual.max(0);
        let delta = actual - settled;
        if delta == 0 {
            return Ok(true);
        }
        if !self
            .repos
            .reservations
            .transition_reservation(
                request_id,
                ReservationState::Settled,
                ReservationState::Settled,
                Some(actual),
            )
            .await?
        {
            return Ok(false);
        }

        match reservation.source {
            BillingSource::Wallet => {
                self.repos.users.adjust_user_quota(reservation.user_id, -delta).await?;
            }
            BillingSource::Subscription { item_id } => {
                let quota_item = self
                    .repos
                    .subscriptions
                    .get_item(item_id)
                    .await?
                    .is_some_and(|item| item.quota_type == QuotaType::Quota);
                if quota_item {
                    self.repos.subscriptions.adjust_item_consumed(item_id, delta).await?;
                }
            }
        }
        if self.token_is_limited(reservation.token_id).await? {
            self.repos
                .tokens
                .adjust_token_quota(reservation.token_id, -delta)
                .await?;
        }
        if let Some(channel_id) = reservation.channel_id {
            self.repos.channels.adjust_channel_used_quota(channel_id, delta).await?;
        }

        let mut entry = LogEntry::new(LogKind::System, request_id, reservation.user_id);
        entry.token_id = Some(reservation.token_id);
        entry.channel_id = reservation.channel_id;
        entry.model.clone_from(&reservation.model);
        entry.quota = delta;
        entry.content = content.to_string();
        self.repos.logs.append_log(entry).await?;

        linfo!(
            request_id,
            LogStage::Billing,
            LogComponent::Billing,
            "adjust_settled",
            "已结算额度调整",
            settled = settled,
            actual = actual
        );
        Ok(true)
    }

    /// 令牌差额；预扣时未扣令牌的有限额令牌按实际额度补扣
    async fn settle_token(&self, reservation: &Reservation, actual: Quota) -> Result<()> {
        if !self.token_is_limited(reservation.token_id).await? {
            return Ok(());
        }
        let delta = actual - reservation.token_amount;
        if delta != 0 {
            self.repos
                .tokens
                .adjust_token_quota(reservation.token_id, -delta)
                .await?;
        }
        Ok(())
    }

    async fn token_charge(&self, reservation: &Reservation, settled: Quota) -> Result<Quota> {
        Ok(if self.token_is_limited(reservation.token_id).await? {
            settled
        } else {
            0
        })
    }

    async fn token_is_limited(&self, token_id: TokenId) -> Result<bool> {
        Ok(self
            .repos
            .tokens
            .get_token(token_id)
            .await?
            .is_some_and(|t| !t.unlimited))
    }

    /// 已结算记录在来源上实际占用的量
    async fn settled_source_amount(&self, reservation: &Reservation, settled: Quota) -> Result<i64> {
        Ok(match reservation.source {
            BillingSource::Wallet => settled,
            BillingSource::Subscription { item_id } => {
                let per_call = self
                    .repos
                    .subscriptions
                    .get_item(item_id)
                    .await?
                    .is_some_and(|item| item.quota_type == QuotaType::PerCall);
                if per_call { reservation.amount } else { settled }
            }
        })
    }

    async fn revert_source(&self, request_id: &str, reservation: &Reservation, amount: i64) {
        if amount == 0 {
            return;
        }
        let result = match reservation.source {
            BillingSource::Wallet => self
                .repos
                .users
                .adjust_user_quota(reservation.user_id, amount)
                .await
                .map(|_| ()),
            BillingSource::Subscription { item_id } => {
                self.repos
                    .subscriptions
                    .adjust_item_consumed(item_id, -amount)
                    .await
            }
        };
        if let Err(e) = result {
            lwarn!(
                request_id,
                LogStage::Billing,
                LogComponent::Billing,
                "revert_source_failed",
                "退还扣费来源失败",
                source = reservation.source.as_str(),
                amount = amount,
                error = %e
            );
        }
    }

    async fn revert_token(&self, request_id: &str, token_id: TokenId, amount: Quota) {
        if amount == 0 {
            return;
        }
        if let Err(e) = self.repos.tokens.adjust_token_quota(token_id, amount).await {
            lwarn!(
                request_id,
                LogStage::Billing,
                LogComponent::Billing,
                "revert_token_failed",
                "退还令牌额度失败",
                token_id = token_id,
                amount = amount,
                error = %e
            );
        }
    }
}

/// 本次扣减让余额跌破预警阈值时记录告警
fn warn_on_threshold(request_id: &str, user_id: UserId, balance: Quota, debited: Quota, threshold: Quota) {
    if threshold > 0 && balance < threshold && balance + debited >= threshold {
        lwarn!(
            request_id,
            LogStage::Billing,
            LogComponent::Billing,
            "quota_warning",
            "用户余额低于预警阈值",
            user_id = user_id,
            balance = balance,
            threshold = threshold
        );
    }
}

/// 共享计费引擎
pub type SharedBillingEngine = Arc<BillingEngine>;
