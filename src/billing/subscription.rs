//! # 订阅额度维护
//!
//! 定期重置到期的订阅额度项，并清理过期的预扣记录。

use crate::config::BillingConfig;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::store::Repositories;
use crate::types::now_timestamp;
use crate::{ldebug, linfo};

const SECONDS_PER_DAY: i64 = 86_400;

/// 订阅维护
#[derive(Clone)]
pub struct SubscriptionMaintenance {
    repos: Repositories,
    batch_size: u64,
    retention_days: i64,
}

impl SubscriptionMaintenance {
    #[must_use]
    pub fn new(repos: Repositories, config: &BillingConfig) -> Self {
        Self {
            repos,
            batch_size: config.subscription_reset_batch.max(1),
            retention_days: config.reservation_retention_days,
        }
    }

    /// 分批重置到期额度项，直到某一批不足批大小
    pub async fn reset_due(&self) -> Result<u64> {
        let now = now_timestamp();
        let mut total = 0;
        loop {
            let reset = self
                .repos
                .subscriptions
                .reset_due_items(now, self.batch_size)
                .await?;
            total += reset;
            if reset < self.batch_size {
                break;
            }
        }
        if total > 0 {
            linfo!(
                "system",
                LogStage::BackgroundTask,
                LogComponent::Subscription,
                "reset_due",
                "订阅额度项已重置",
                count = total
            );
        }
        Ok(total)
    }

    /// 删除保留期之前已结束的预扣记录
    pub async fn purge_reservations(&self) -> Result<u64> {
        let before = now_timestamp() - self.retention_days * SECONDS_PER_DAY;
        let purged = self.repos.reservations.purge_reservations(before).await?;
        ldebug!(
            "system",
            LogStage::BackgroundTask,
            LogComponent::Subscription,
            "purge_reservations",
            "预扣记录清理完成",
            count = purged
        );
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, QuotaType, Reservation, ReservationState, SubscriptionItem};
    use crate::types::BillingSource;

    fn due_item(id: i64, now: i64) -> SubscriptionItem {
        SubscriptionItem {
            id,
            user_id: 1,
            plan_id: 1,
            quota_type: QuotaType::Quota,
            total: 100,
            consumed: 80,
            reset_period_secs: 3_600,
            next_reset_at: Some(now - 10),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_reset_runs_in_batches() {
        let store = MemoryStore::new();
        let now = now_timestamp();
        for id in 1..=7 {
            store.insert_subscription_item(due_item(id, now));
        }
        let config = BillingConfig {
            subscription_reset_batch: 3,
            ..BillingConfig::default()
        };
        let maintenance = SubscriptionMaintenance::new(Repositories::from_store(store.clone()), &config);

        assert_eq!(maintenance.reset_due().await.unwrap(), 7);
        let item = store.subscription_item(4).unwrap();
        assert_eq!(item.consumed, 0);
        assert!(item.next_reset_at.unwrap() > now);
        assert_eq!(maintenance.reset_due().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_keeps_open_and_recent() {
        let store = MemoryStore::new();
        let repos = Repositories::from_store(store.clone());
        let now = now_timestamp();
        let reservation = |rid: &str, state, created_at| Reservation {
            request_id: rid.to_string(),
            user_id: 1,
            token_id: 1,
            channel_id: None,
            model: "m".into(),
            source: BillingSource::Wallet,
            amount: 1,
            token_amount: 1,
            quota: 1,
            state,
            settled_quota: None,
            created_at,
            touched_at: created_at,
        };
        let old = now - 30 * SECONDS_PER_DAY;
        for r in [
            reservation("old-settled", ReservationState::Settled, old),
            reservation("old-open", ReservationState::Open, old),
            reservation("new-settled", ReservationState::Settled, now),
        ] {
            repos.reservations.insert_reservation(&r).await.unwrap();
        }

        let maintenance = SubscriptionMaintenance::new(repos.clone(), &BillingConfig::default());
        assert_eq!(maintenance.purge_reservations().await.unwrap(), 1);
        assert!(repos.reservations.get_reservation("old-open").await.unwrap().is_some());
        assert!(repos.reservations.get_reservation("old-settled").await.unwrap().is_none());
    }
}
