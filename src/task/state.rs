//! # 任务状态缓存
//!
//! 未结束的任务在缓存中保存 `task:{platform}:{task_id}` 状态键，并交给保活管理器续期；
//! 任务进入终态时删除键并停止跟踪。

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheBackend, CacheKeyBuilder};
use crate::error::Result;
use crate::keepalive::KeepAliveManager;
use crate::store::{Task, TaskStatus};

/// 任务状态键的读写与保活登记
pub struct TaskStateCache {
    backend: Arc<dyn CacheBackend>,
    keepalive: Arc<KeepAliveManager>,
    expiry: Duration,
}

impl TaskStateCache {
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>, keepalive: Arc<KeepAliveManager>, expiry: Duration) -> Self {
        Self {
            backend,
            keepalive,
            expiry,
        }
    }

    /// 状态键名
    #[must_use]
    pub fn key(platform: &str, task_id: &str) -> String {
        CacheKeyBuilder::task(platform, task_id).build()
    }

    /// 写入状态键并开始保活
    pub async fn track(&self, task: &Task) -> Result<()> {
        self.write(task, task.status, &task.progress).await?;
        self.keepalive
            .add_key(Self::key(&task.platform, &task.task_id), self.expiry);
        Ok(())
    }

    /// 更新进行中任务的状态，不重置保活计时
    pub async fn update(&self, task: &Task, status: TaskStatus, progress: &str) -> Result<()> {
        self.write(task, status, progress).await
    }

    /// 任务结束：停止保活并删除键
    pub async fn finish(&self, platform: &str, task_id: &str) -> Result<bool> {
        let key = Self::key(platform, task_id);
        self.keepalive.remove_key(&key);
        self.backend.delete(&key).await
    }

    /// 读取状态键，键不存在或内容无法解析时返回 `None`
    pub async fn get(&self, platform: &str, task_id: &str) -> Result<Option<serde_json::Value>> {
        let raw = self.backend.get(&Self::key(platform, task_id)).await?;
        Ok(raw.and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    async fn write(&self, task: &Task, status: TaskStatus, progress: &str) -> Result<()> {
        let value = json!({
            "status": status,
            "progress": progress,
            "channel_id": task.channel_id,
            "upstream_task_id": task.upstream_task_id,
        });
        self.backend
            .set_with_ttl(
                &Self::key(&task.platform, &task.task_id),
                &value.to_string(),
                Some(self.expiry),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::BillingSnapshot;
    use crate::cache::MemoryCache;
    use crate::config::KeepAliveConfig;
    use crate::types::BillingSource;
    use pretty_assertions::assert_eq;

    fn task() -> Task {
        Task {
            task_id: "task_9".into(),
            upstream_task_id: "up-9".into(),
            platform: "task".into(),
            request_id: "req-9".into(),
            user_id: 1,
            token_id: 2,
            channel_id: 3,
            action: "generate".into(),
            model: "video-1".into(),
            status: TaskStatus::Submitted,
            progress: String::new(),
            fail_reason: None,
            quota: 100,
            billing_source: BillingSource::Wallet,
            submit_time: 0,
            finish_time: None,
            data: json!({}),
            billing_snapshot: BillingSnapshot::default(),
        }
    }

    #[tokio::test]
    async fn test_track_then_finish() {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new(16));
        let keepalive = Arc::new(KeepAliveManager::new(Arc::clone(&backend), KeepAliveConfig::default()));
        let cache = TaskStateCache::new(Arc::clone(&backend), Arc::clone(&keepalive), Duration::from_secs(600));
        let task = task();

        cache.track(&task).await.unwrap();
        assert_eq!(keepalive.len(), 1);
        assert!(backend.ttl("task:task:task_9").await.unwrap().is_some());

        cache.update(&task, TaskStatus::InProgress, "40%").await.unwrap();
        let state = cache.get("task", "task_9").await.unwrap().unwrap();
        assert_eq!(state["status"], json!(TaskStatus::InProgress));
        assert_eq!(state["progress"], "40%");

        assert!(cache.finish("task", "task_9").await.unwrap());
        assert!(keepalive.is_empty());
        assert_eq!(cache.get("task", "task_9").await.unwrap(), None);
    }
}
