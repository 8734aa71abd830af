//! # 渠道实体定义

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 上游渠道；密钥及其禁用原因以 JSON 形式内联保存
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub provider: String,
    #[sea_orm(column_type = "Text")]
    pub base_url: String,
    /// `[{secret, status, disabled_reason, disabled_at}]`
    #[sea_orm(column_type = "Text")]
    pub keys: String,
    #[sea_orm(column_type = "Text")]
    pub models: String,
    #[sea_orm(column_type = "Text")]
    pub model_mapping: String,
    #[sea_orm(column_type = "Text")]
    pub groups: String,
    #[sea_orm(column_type = "Text")]
    pub model_caps: String,
    pub daily_request_budget: Option<i64>,
    pub priority: i64,
    pub weight: i32,
    pub status: String,
    pub disabled_reason: Option<String>,
    pub disabled_at: Option<i64>,
    pub used_quota: i64,
    #[sea_orm(column_type = "Text")]
    pub header_overrides: String,
    #[sea_orm(column_type = "Text")]
    pub other: String,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
