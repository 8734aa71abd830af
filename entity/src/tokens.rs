//! # 令牌实体定义

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 用户签发的 API 令牌，只保存密钥哈希
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "tokens")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    #[sea_orm(unique)]
    pub key_hash: String,
    pub remain_quota: i64,
    pub unlimited: bool,
    /// JSON 数组
    #[sea_orm(column_type = "Text")]
    pub allowed_groups: String,
    /// JSON 数组
    #[sea_orm(column_type = "Text")]
    pub allowed_models: String,
    pub expires_at: Option<i64>,
    pub status: String,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
