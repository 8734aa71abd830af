//! # 订阅额度项实体定义

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 用户 × 套餐 × 额度类型 的计数器
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "subscription_items")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub plan_id: i64,
    /// `per_call` 或 `quota`
    pub quota_type: String,
    pub total: i64,
    pub consumed: i64,
    pub reset_period_secs: i64,
    pub next_reset_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
