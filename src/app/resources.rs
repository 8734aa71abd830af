use crate::cache::{CacheHandles, init_cache};
use crate::config::{AppConfig, OptionStore, StoreBackend};
use crate::database::init_database;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::linfo;
use crate::store::{DatabaseStore, MemoryStore, Repositories};
use std::sync::Arc;

/// 应用基础资源：配置、仓储、缓存与运行时选项
pub struct AppResources {
    config: Arc<AppConfig>,
    repos: Repositories,
    cache: CacheHandles,
    options: Arc<OptionStore>,
}

impl AppResources {
    /// 根据配置连接存储与缓存
    pub async fn build(config: Arc<AppConfig>) -> Result<Arc<Self>> {
        let repos = match config.database.backend {
            StoreBackend::Memory => Repositories::from_store(MemoryStore::new()),
            StoreBackend::Database => {
                let db = init_database(&config.database).await?;
                Repositories::from_store(Arc::new(DatabaseStore::new(db)))
            }
        };
        let cache = init_cache(&config.cache).await?;
        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::ServerSetup,
            "resources_ready",
            "基础资源初始化完成",
            store = ?config.database.backend,
            cache = cache.backend.backend_name()
        );
        Ok(Self::with_parts(config, repos, cache))
    }

    /// 用现成的仓储与缓存组装资源层
    #[must_use]
    pub fn with_parts(config: Arc<AppConfig>, repos: Repositories, cache: CacheHandles) -> Arc<Self> {
        let options = Arc::new(OptionStore::new(config.options.clone()));
        Arc::new(Self {
            config,
            repos,
            cache,
            options,
        })
    }

    #[must_use]
    pub fn config(&self) -> Arc<AppConfig> {
        Arc::clone(&self.config)
    }

    #[must_use]
    pub fn repositories(&self) -> Repositories {
        self.repos.clone()
    }

    #[must_use]
    pub fn cache(&self) -> CacheHandles {
        self.cache.clone()
    }

    #[must_use]
    pub fn options(&self) -> Arc<OptionStore> {
        Arc::clone(&self.options)
    }
}
