//! # 预扣费记录实体定义

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 每个请求一条预扣记录，用于幂等结算与对账
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "reservations")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub request_id: String,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: Option<i64>,
    pub model: String,
    /// `wallet` 或 `subscription`
    pub source: String,
    pub subscription_item_id: Option<i64>,
    pub amount: i64,
    pub token_amount: i64,
    /// 预扣对应的额度值
    pub quota: i64,
    /// `open` / `settled` / `refunded`
    pub state: String,
    pub settled_quota: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
