//! # 预扣对账
//!
//! 超过转发超时加宽限期仍处于 open 的预扣视为孤儿记录（例如请求处理中途 panic），
//! 全额退还并写一条系统日志。

use super::engine::BillingEngine;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::store::{LogEntry, LogKind};
use crate::types::now_timestamp;
use crate::{linfo, lwarn};

/// 单轮对账处理的最大记录数
const RECONCILE_BATCH: u64 = 200;

pub const RECONCILE_REASON: &str = "请求未结算，对账退还";

/// 对账任务
#[derive(Clone)]
pub struct Reconciler {
    engine: BillingEngine,
    /// open 记录被视为孤儿前的最小存活时间（秒）
    stale_after_secs: i64,
}

impl Reconciler {
    #[must_use]
    pub fn new(engine: BillingEngine, relay_timeout_secs: u64, grace_secs: i64) -> Self {
        let timeout = i64::try_from(relay_timeout_secs).unwrap_or(i64::MAX / 2);
        Self {
            engine,
            stale_after_secs: timeout.saturating_add(grace_secs.max(0)),
        }
    }

    /// 执行一轮对账，返回退还条数
    pub async fn run_once(&self) -> Result<usize> {
        let before = now_timestamp().saturating_sub(self.stale_after_secs);
        let repos = self.engine.repositories();
        let stale = repos
            .reservations
            .stale_open_reservations(before, RECONCILE_BATCH)
            .await?;

        let mut refunded = 0;
        for reservation in stale {
            let rid = reservation.request_id.as_str();
            match self.engine.refund(rid, RECONCILE_REASON).await {
                Ok(true) => {
                    refunded += 1;
                    let mut entry = LogEntry::new(LogKind::System, rid, reservation.user_id);
                    entry.token_id = Some(reservation.token_id);
                    entry.channel_id = reservation.channel_id;
                    entry.model.clone_from(&reservation.model);
                    entry.quota = reservation.quota;
                    entry.content = RECONCILE_REASON.to_string();
                    repos.logs.append_log(entry).await?;
                }
                Ok(false) => {}
                Err(e) => {
                    lwarn!(
                        rid,
                        LogStage::Billing,
                        LogComponent::Reconciler,
                        "reconcile_refund_failed",
                        "对账退还失败",
                        error = %e
                    );
                }
            }
        }

        if refunded > 0 {
            linfo!(
                "system",
                LogStage::BackgroundTask,
                LogComponent::Reconciler,
                "reconcile",
                "孤儿预扣已退还",
                count = refunded
            );
        }
        Ok(refunded)
    }
}
