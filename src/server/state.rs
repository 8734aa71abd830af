use std::ops::Deref;
use std::sync::Arc;

use crate::app::AppServices;
use crate::config::OptionStore;
use crate::store::Repositories;

/// 处理器共享状态
#[derive(Clone)]
pub struct ServerState {
    services: Arc<AppServices>,
    repos: Repositories,
    options: Arc<OptionStore>,
    admin_token: Option<Arc<str>>,
}

impl ServerState {
    #[must_use]
    pub fn new(services: Arc<AppServices>) -> Self {
        let resources = services.resources();
        let admin_token = resources
            .config()
            .server
            .admin_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(Arc::from);
        Self {
            repos: resources.repositories(),
            options: resources.options(),
            admin_token,
            services,
        }
    }

    #[must_use]
    pub const fn repositories(&self) -> &Repositories {
        &self.repos
    }

    #[must_use]
    pub const fn options(&self) -> &Arc<OptionStore> {
        &self.options
    }

    /// 管理令牌，未配置时管理接口关闭
    #[must_use]
    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }
}

impl Deref for ServerState {
    type Target = AppServices;

    fn deref(&self) -> &Self::Target {
        &self.services
    }
}
