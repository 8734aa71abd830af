//! # 用户实体定义

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 用户实体，额度单位为百万分之一
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub email: String,
    pub group_name: String,
    pub quota: i64,
    pub status: String,
    pub billing_preference: String,
    pub warning_threshold: i64,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
