use crate::app::periodic::PeriodicTask;
use crate::app::service_registry::AppServices;
use crate::app::task_scheduler::{ScheduledTask, TaskScheduler};
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// 后台任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// 清理限流器的过期计数
    LimiterSweep,
    /// 从存储重新加载渠道
    ChannelRefresh,
    /// 到期自动恢复被禁用的渠道
    ChannelReenable,
    /// 轮询异步任务状态
    TaskPoll,
    /// 重置到期的订阅额度
    SubscriptionReset,
    /// 清理历史预扣记录
    ReservationCleanup,
    /// 退还孤儿预扣
    Reconcile,
    /// 缓存键续期
    KeepAlive,
    /// 在途流量统计日志
    TrafficReport,
}

impl TaskType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LimiterSweep => "limiter_sweep",
            Self::ChannelRefresh => "channel_refresh",
            Self::ChannelReenable => "channel_reenable",
            Self::TaskPoll => "task_poll",
            Self::SubscriptionReset => "subscription_reset",
            Self::ReservationCleanup => "reservation_cleanup",
            Self::Reconcile => "reconcile",
            Self::KeepAlive => "keepalive",
            Self::TrafficReport => "traffic_report",
        }
    }
}

/// 后台任务集合
///
/// 任务依赖的服务从 `AppServices` 获取；任务轮询、订阅重置、预扣清理与对账只在主节点运行。
pub struct AppTasks {
    scheduler: Arc<TaskScheduler>,
}

impl AppTasks {
    /// 初始化调度器并注册后台任务
    pub async fn initialize(services: &Arc<AppServices>) -> Result<Arc<Self>> {
        let config = services.resources().config();
        let scheduler = Arc::new(TaskScheduler::new());
        let mut tasks: Vec<PeriodicTask> = Vec::new();

        let limiter = services.limiter();
        tasks.push(PeriodicTask::new(
            TaskType::LimiterSweep,
            Duration::from_secs(config.rate_limit.sweep_interval_secs),
            move || {
                let limiter = limiter.clone();
                async move {
                    limiter.sweep().await;
                    Ok(())
                }
            },
        ));

        let registry = services.registry();
        tasks.push(PeriodicTask::new(
            TaskType::ChannelRefresh,
            Duration::from_secs(config.channel.update_frequency_secs),
            move || {
                let registry = Arc::clone(&registry);
                async move { registry.refresh().await.map(|_| ()) }
            },
        ));

        let registry = services.registry();
        tasks.push(PeriodicTask::new(
            TaskType::ChannelReenable,
            Duration::from_secs(config.channel.test_frequency_secs),
            move || {
                let registry = Arc::clone(&registry);
                async move {
                    registry.reenable_sweep().await;
                    Ok(())
                }
            },
        ));

        let keepalive = services.keepalive();
        tasks.push(PeriodicTask::new(
            TaskType::KeepAlive,
            Duration::from_secs(config.keepalive.min_interval_secs),
            move || {
                let keepalive = Arc::clone(&keepalive);
                async move {
                    keepalive.run_once(tokio::time::Instant::now()).await;
                    Ok(())
                }
            },
        ));

        if config.traffic.monitor_enabled {
            let traffic = services.traffic();
            tasks.push(PeriodicTask::new(
                TaskType::TrafficReport,
                Duration::from_secs(config.traffic.report_interval_secs),
                move || {
                    traffic.report();
                    async { Ok(()) }
                },
            ));
        }

        if config.server.master_node {
            let poller = services.task_poller();
            tasks.push(PeriodicTask::new(TaskType::TaskPoll, poller.interval(), move || {
                let poller = Arc::clone(&poller);
                async move { poller.run_once().await.map(|_| ()) }
            }));

            let subscriptions = services.subscriptions();
            tasks.push(PeriodicTask::new(
                TaskType::SubscriptionReset,
                Duration::from_secs(config.billing.subscription_reset_interval_secs),
                move || {
                    let subscriptions = subscriptions.clone();
                    async move { subscriptions.reset_due().await.map(|_| ()) }
                },
            ));

            let subscriptions = services.subscriptions();
            tasks.push(PeriodicTask::new(
                TaskType::ReservationCleanup,
                Duration::from_secs(config.billing.reservation_cleanup_interval_secs),
                move || {
                    let subscriptions = subscriptions.clone();
                    async move { subscriptions.purge_reservations().await.map(|_| ()) }
                },
            ));

            let reconciler = services.reconciler();
            tasks.push(PeriodicTask::new(
                TaskType::Reconcile,
                Duration::from_secs(config.billing.reconcile_interval_secs),
                move || {
                    let reconciler = reconciler.clone();
                    async move { reconciler.run_once().await.map(|_| ()) }
                },
            ));
        }

        scheduler
            .register_many(tasks.into_iter().map(ScheduledTask::from).collect())
            .await;

        Ok(Arc::new(Self { scheduler }))
    }

    #[must_use]
    pub fn scheduler(&self) -> Arc<TaskScheduler> {
        Arc::clone(&self.scheduler)
    }
}
