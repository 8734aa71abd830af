//! # 周期任务
//!
//! 以固定间隔执行一个异步动作；停止时取消并等待任务结束。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::tasks::TaskType;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lwarn};

type TickFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type TickAction = Arc<dyn Fn() -> TickFuture + Send + Sync>;

/// 周期任务
#[derive(Clone)]
pub struct PeriodicTask {
    task_type: TaskType,
    interval: Duration,
    action: TickAction,
    cancel: Arc<RwLock<Option<CancellationToken>>>,
    task_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl PeriodicTask {
    #[must_use]
    pub fn new<F, Fut>(task_type: TaskType, interval: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            task_type,
            interval: interval.max(Duration::from_millis(10)),
            action: Arc::new(move || Box::pin(action())),
            cancel: Arc::new(RwLock::new(None)),
            task_handle: Arc::new(RwLock::new(None)),
        }
    }

    #[must_use]
    pub const fn task_type(&self) -> TaskType {
        self.task_type
    }

    /// 启动循环；首个周期立即执行
    pub async fn start(&self) -> Result<()> {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let action = Arc::clone(&self.action);
        let interval = self.interval;
        let task_type = self.task_type;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let tick = action();
                let result = tokio::select! {
                    () = token.cancelled() => break,
                    result = tick => result,
                };
                if let Err(e) = result {
                    lwarn!(
                        "system",
                        LogStage::BackgroundTask,
                        LogComponent::Scheduler,
                        "tick_failed",
                        "后台任务执行失败",
                        task = task_type.as_str(),
                        error = %e
                    );
                }
            }
            ldebug!(
                "system",
                LogStage::Shutdown,
                LogComponent::Scheduler,
                "loop_exited",
                "后台任务循环退出",
                task = task_type.as_str()
            );
        });

        *self.cancel.write().await = Some(cancel);
        *self.task_handle.write().await = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.cancel.write().await.take() {
            cancel.cancel();
        }
        let handle = self.task_handle.write().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.task_handle
            .read()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}
