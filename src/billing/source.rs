//! # 扣费来源
//!
//! 按用户偏好在订阅额度项与钱包之间选择扣费来源，并在来源上完成预留。

use crate::error::{RelayError, Result};
use crate::store::{QuotaType, Repositories, User};
use crate::types::{BillingPreference, BillingSource, Quota};

/// 在来源上完成的预留
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceReservation {
    pub source: BillingSource,
    /// 从来源扣除的量：钱包为额度，按次订阅为 1，额度订阅为额度
    pub amount: i64,
    /// 钱包扣减后的余额
    pub wallet_balance: Option<Quota>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Subscription,
    Wallet,
}

const fn plan(preference: BillingPreference) -> &'static [Attempt] {
    match preference {
        BillingPreference::SubscriptionFirst => &[Attempt::Subscription, Attempt::Wallet],
        BillingPreference::WalletFirst => &[Attempt::Wallet, Attempt::Subscription],
        BillingPreference::SubscriptionOnly => &[Attempt::Subscription],
        BillingPreference::WalletOnly => &[Attempt::Wallet],
    }
}

/// 每个有效额度项依次尝试，按次额度项预留 1 次，额度型预留全额
async fn try_subscription(
    repos: &Repositories,
    user: &User,
    quota: Quota,
    now: i64,
) -> Result<Option<SourceReservation>> {
    for item in repos.subscriptions.active_items(user.id, now).await? {
        let amount = match item.quota_type {
            QuotaType::PerCall => 1,
            QuotaType::Quota => quota,
        };
        if item.remaining() < amount {
            continue;
        }
        if repos.subscriptions.try_reserve_item(item.id, amount, now).await? {
            return Ok(Some(SourceReservation {
                source: BillingSource::Subscription { item_id: item.id },
                amount,
                wallet_balance: None,
            }));
        }
    }
    Ok(None)
}

async fn try_wallet(repos: &Repositories, user: &User, quota: Quota) -> Result<Option<SourceReservation>> {
    Ok(repos
        .users
        .try_debit_user(user.id, quota)
        .await?
        .map(|balance| SourceReservation {
            source: BillingSource::Wallet,
            amount: quota,
            wallet_balance: Some(balance),
        }))
}

/// 按偏好预留，全部来源不足时返回预扣错误
///
/// 免费请求不占用订阅次数，直接记为钱包来源。
pub async fn reserve_from_source(
    repos: &Repositories,
    user: &User,
    quota: Quota,
    now: i64,
) -> Result<SourceReservation> {
    if quota <= 0 {
        return Ok(SourceReservation {
            source: BillingSource::Wallet,
            amount: 0,
            wallet_balance: None,
        });
    }
    for attempt in plan(user.billing_preference) {
        let reserved = match attempt {
            Attempt::Subscription => try_subscription(repos, user, quota, now).await?,
            Attempt::Wallet => try_wallet(repos, user, quota).await?,
        };
        if let Some(reserved) = reserved {
            return Ok(reserved);
        }
    }
    Err(match user.billing_preference {
        BillingPreference::SubscriptionOnly => RelayError::pre_consume("订阅额度不足"),
        BillingPreference::WalletOnly => RelayError::pre_consume("钱包余额不足"),
        _ => RelayError::pre_consume("订阅额度与钱包余额均不足"),
    })
}
