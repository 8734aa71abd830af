//! # 异步任务实体定义

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 长时间运行的上游任务
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "tasks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub task_id: String,
    pub upstream_task_id: String,
    pub platform: String,
    pub request_id: String,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub action: String,
    pub model: String,
    pub status: String,
    pub progress: String,
    pub fail_reason: Option<String>,
    pub quota: i64,
    pub billing_source: String,
    pub subscription_item_id: Option<i64>,
    pub submit_time: i64,
    pub finish_time: Option<i64>,
    #[sea_orm(column_type = "Text")]
    pub data: String,
    #[sea_orm(column_type = "Text")]
    pub billing_snapshot: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
