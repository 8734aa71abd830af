use crate::adaptor::AdaptorSet;
use crate::adaptor::image::ImageFetcher;
use crate::affinity::AffinityCache;
use crate::app::resources::AppResources;
use crate::billing::{BillingEngine, Reconciler, SubscriptionMaintenance};
use crate::channel::{ChannelRegistry, ChannelSelector};
use crate::error::Result;
use crate::keepalive::KeepAliveManager;
use crate::ratelimit::RateLimiter;
use crate::recent_calls::RecentCalls;
use crate::relay::{RelayDeps, RelayService};
use crate::task::{TaskManager, TaskPlatforms, TaskPoller, TaskStateCache};
use crate::traffic::TrafficMonitor;
use std::sync::Arc;
use std::time::Duration;

/// 亲和绑定的最大条目数
const AFFINITY_CAPACITY: u64 = 100_000;

/// 业务服务集合
///
/// 只负责构建与持有服务实例，后台任务由 `AppTasks` 管理。
pub struct AppServices {
    resources: Arc<AppResources>,
    registry: Arc<ChannelRegistry>,
    limiter: RateLimiter,
    relay: Arc<RelayService>,
    task_manager: Arc<TaskManager>,
    task_poller: Arc<TaskPoller>,
    reconciler: Reconciler,
    subscriptions: SubscriptionMaintenance,
    keepalive: Arc<KeepAliveManager>,
    traffic: Arc<TrafficMonitor>,
}

impl AppServices {
    /// 根据基础资源初始化业务服务
    pub async fn initialize(resources: &Arc<AppResources>) -> Result<Arc<Self>> {
        let config = resources.config();
        let repos = resources.repositories();
        let cache = resources.cache();

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.relay.connect_timeout_secs))
            .build()?;
        let images = ImageFetcher::new(
            client.clone(),
            config.relay.image_max_bytes,
            Duration::from_secs(config.relay.image_timeout_secs),
        );
        let adaptors = AdaptorSet::new(images, &config.relay.header_key_overrides);

        let registry = ChannelRegistry::load(Arc::clone(&repos.channels)).await?;
        let limiter = RateLimiter::from_cache(&cache, config.rate_limit.clone());
        let selector = Arc::new(ChannelSelector::new(Arc::clone(&registry), limiter.clone()));
        let billing = BillingEngine::new(repos.clone());
        let platforms = TaskPlatforms::default();

        let relay = Arc::new(RelayService::new(RelayDeps {
            client: client.clone(),
            adaptors,
            selector,
            limiter: limiter.clone(),
            billing: billing.clone(),
            affinity: Arc::new(AffinityCache::new(AFFINITY_CAPACITY)),
            recent_calls: Arc::new(RecentCalls::new(config.recent_calls.clone())),
            config: config.relay.clone(),
        }));

        let keepalive = Arc::new(KeepAliveManager::new(
            Arc::clone(&cache.backend),
            config.keepalive.clone(),
        ));
        let task_states = Arc::new(TaskStateCache::new(
            Arc::clone(&cache.backend),
            Arc::clone(&keepalive),
            Duration::from_secs(config.task.state_ttl_secs),
        ));
        let task_manager = Arc::new(TaskManager::new(
            Arc::clone(&relay),
            platforms.clone(),
            Arc::clone(&task_states),
            config.task.clone(),
        ));
        let task_poller = Arc::new(TaskPoller::new(
            billing.clone(),
            Arc::clone(&registry),
            client,
            platforms,
            task_states,
            resources.options(),
            config.task.clone(),
        ));

        let reconciler = Reconciler::new(
            billing,
            config.relay.timeout_secs,
            config.billing.reconcile_grace_secs,
        );
        let subscriptions = SubscriptionMaintenance::new(repos, &config.billing);
        Ok(Arc::new(Self {
            resources: Arc::clone(resources),
            registry,
            limiter,
            relay,
            task_manager,
            task_poller,
            reconciler,
            subscriptions,
            keepalive,
            traffic: TrafficMonitor::new(),
        }))
    }

    #[must_use]
    pub fn resources(&self) -> Arc<AppResources> {
        Arc::clone(&self.resources)
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ChannelRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn limiter(&self) -> RateLimiter {
        self.limiter.clone()
    }

    #[must_use]
    pub fn relay(&self) -> Arc<RelayService> {
        Arc::clone(&self.relay)
    }

    #[must_use]
    pub fn task_manager(&self) -> Arc<TaskManager> {
        Arc::clone(&self.task_manager)
    }

    #[must_use]
    pub fn task_poller(&self) -> Arc<TaskPoller> {
        Arc::clone(&self.task_poller)
    }

    #[must_use]
    pub fn reconciler(&self) -> Reconciler {
        self.reconciler.clone()
    }

    #[must_use]
    pub fn subscriptions(&self) -> SubscriptionMaintenance {
        self.subscriptions.clone()
    }

    #[must_use]
    pub fn keepalive(&self) -> Arc<KeepAliveManager> {
        Arc::clone(&self.keepalive)
    }

    #[must_use]
    pub fn traffic(&self) -> Arc<TrafficMonitor> {
        Arc::clone(&self.traffic)
    }
}
