//! # 数据库模块
//!
//! 数据库连接与开发环境建表。正式环境的表结构迁移由外部工具负责。

use crate::config::DatabaseConfig;
use crate::error::{RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo};
use entity::{Channels, ConsumptionLogs, Reservations, SubscriptionItems, Tasks, Tokens, Users};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, EntityTrait, Schema,
};
use std::time::Duration;

/// 连接数据库
///
/// 内存 SQLite 每个连接都是独立的库，因此限制为单连接。
pub async fn connect(database_url: &str) -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new(database_url.to_string());
    options.sqlx_logging(false);
    if database_url.contains(":memory:") {
        options.max_connections(1).min_connections(1);
    }

    let db = Database::connect(options).await?;
    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Database,
        "connected",
        "数据库连接成功",
        url = %redact_url(database_url)
    );
    Ok(db)
}

/// 按配置初始化数据库连接，必要时创建 SQLite 文件与表
pub async fn init_database(config: &DatabaseConfig) -> Result<DatabaseConnection> {
    let url = config.get_connection_url()?;
    let mut options = ConnectOptions::new(url.clone());
    options
        .max_connections(config.max_connections)
        .connect_timeout(Duration::from_secs(config.connect_timeout))
        .sqlx_logging(false);
    if config.is_memory_database() {
        options.max_connections(1).min_connections(1);
    }

    let db = Database::connect(options)
        .await
        .map_err(|e| RelayError::database_with_source("数据库连接失败", e))?;

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Database,
        "connected",
        "数据库连接成功",
        url = %redact_url(&url)
    );

    if config.auto_create {
        create_tables(&db).await?;
    }
    Ok(db)
}

async fn create_table<E>(db: &DatabaseConnection, schema: &Schema, entity: E) -> Result<()>
where
    E: EntityTrait,
{
    let backend = db.get_database_backend();
    let table = entity.table_name().to_string();
    let mut statement = schema.create_table_from_entity(entity);
    statement.if_not_exists();
    db.execute(backend.build(&statement)).await?;
    ldebug!(
        "system",
        LogStage::Db,
        LogComponent::Database,
        "table_ready",
        "数据表已就绪",
        table = %table
    );
    Ok(())
}

/// 根据实体定义创建缺失的表
pub async fn create_tables(db: &DatabaseConnection) -> Result<()> {
    let schema = Schema::new(db.get_database_backend());
    create_table(db, &schema, Users).await?;
    create_table(db, &schema, Tokens).await?;
    create_table(db, &schema, Channels).await?;
    create_table(db, &schema, SubscriptionItems).await?;
    create_table(db, &schema, Reservations).await?;
    create_table(db, &schema, Tasks).await?;
    create_table(db, &schema, ConsumptionLogs).await?;
    Ok(())
}

/// 隐藏连接串中的密码
fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_tables_is_idempotent() {
        let db = connect("sqlite::memory:").await.unwrap();
        create_tables(&db).await.unwrap();
        create_tables(&db).await.unwrap();
    }

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("postgres://relay:secret@db:5432/relay"),
            "postgres://relay:***@db:5432/relay"
        );
        assert_eq!(redact_url("sqlite::memory:"), "sqlite::memory:");
    }
}
