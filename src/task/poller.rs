//! # 任务轮询
//!
//! 主节点定期拉取未结束的任务：超时的任务直接失败退还，其余按渠道批量查询上游状态。
//! 同一任务的退还由预扣记录的状态转换保证只发生一次。

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::manager::TaskPlatforms;
use super::state::TaskStateCache;
use super::status::StatusMapper;
use crate::adaptor::task::{TaskAdaptor, TaskUpdate};
use crate::adaptor::usage::extract_usage;
use crate::billing::{BillingEngine, BillingMode};
use crate::channel::ChannelRegistry;
use crate::config::{OptionStore, TaskConfig};
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::store::{LogEntry, LogKind, Task, TaskStatus};
use crate::types::{ChannelId, Quota, now_timestamp};
use crate::{ldebug, linfo, lwarn};

pub const TASK_TIMEOUT_REASON: &str = "任务执行超时";

const TASK_COMPLETED_CONTENT: &str = "任务完成，按实际用量结算";

/// 一轮轮询的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub timed_out: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub updated: usize,
}

impl PollStats {
    fn absorb(&mut self, other: Self) {
        self.timed_out += other.timed_out;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.updated += other.updated;
    }
}

/// 任务轮询器
#[derive(Clone)]
pub struct TaskPoller {
    billing: BillingEngine,
    registry: Arc<ChannelRegistry>,
    client: reqwest::Client,
    platforms: TaskPlatforms,
    states: Arc<TaskStateCache>,
    options: Arc<OptionStore>,
    config: TaskConfig,
}

/// 已完成任务的实际额度：按提交时保存的计费快照重算
fn completed_quota(task: &Task, update: &TaskUpdate) -> Quota {
    let snapshot = &task.billing_snapshot;
    match snapshot.mode {
        BillingMode::PerCall => snapshot.per_call_quota(),
        BillingMode::Usage => extract_usage(&update.data).map_or(task.quota, |usage| snapshot.quota_for(&usage)),
        BillingMode::Free => 0,
    }
}

impl TaskPoller {
    #[must_use]
    pub const fn new(
        billing: BillingEngine,
        registry: Arc<ChannelRegistry>,
        client: reqwest::Client,
        platforms: TaskPlatforms,
        states: Arc<TaskStateCache>,
        options: Arc<OptionStore>,
        config: TaskConfig,
    ) -> Self {
        Self {
            billing,
            registry,
            client,
            platforms,
            states,
            options,
            config,
        }
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval_secs)
    }

    /// 轮询全部平台一次
    pub async fn run_once(&self) -> Result<PollStats> {
        let mut stats = PollStats::default();
        let platforms: Vec<String> = self.platforms.names().map(ToString::to_string).collect();
        for platform in platforms {
            stats.absorb(self.poll_platform(&platform).await?);
        }
        if stats != PollStats::default() {
            linfo!(
                "system",
                LogStage::BackgroundTask,
                LogComponent::TaskPoller,
                "poll_round",
                "任务轮询完成",
                timed_out = stats.timed_out,
                succeeded = stats.succeeded,
                failed = stats.failed,
                updated = stats.updated
            );
        }
        Ok(stats)
    }

    async fn poll_platform(&self, platform: &str) -> Result<PollStats> {
        let repos = self.billing.repositories();
        let tasks = repos
            .tasks
            .unfinished_tasks(platform, self.config.batch_size.max(1))
            .await?;
        let mut stats = PollStats::default();
        if tasks.is_empty() {
            return Ok(stats);
        }

        let now = now_timestamp();
        let mut by_channel: HashMap<ChannelId, Vec<Task>> = HashMap::new();
        for task in tasks {
            if now - task.submit_time >= self.config.timeout_secs {
                if self.fail_task(&task, TASK_TIMEOUT_REASON, true).await? {
                    stats.timed_out += 1;
                }
            } else {
                by_channel.entry(task.channel_id).or_default().push(task);
            }
        }

        let adaptor = self.platforms.get(platform)?;
        let mapper = StatusMapper::new(&self.options.snapshot().task_status_mapping);
        let results: Vec<PollStats> = futures::stream::iter(by_channel)
            .map(|(channel_id, tasks)| {
                let adaptor = Arc::clone(&adaptor);
                let mapper = &mapper;
                async move { self.poll_channel(adaptor.as_ref(), mapper, channel_id, tasks).await }
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;
        for result in results {
            stats.absorb(result);
        }
        Ok(stats)
    }

    /// 一个渠道的一次批量查询；查询失败只记录日志，下一轮重试
    async fn poll_channel(
        &self,
        adaptor: &dyn TaskAdaptor,
        mapper: &StatusMapper,
        channel_id: ChannelId,
        tasks: Vec<Task>,
    ) -> PollStats {
        let mut stats = PollStats::default();
        let snapshot = self.registry.snapshot();
        let Some(channel) = snapshot.channel(channel_id) else {
            lwarn!(
                "system",
                LogStage::BackgroundTask,
                LogComponent::TaskPoller,
                "channel_missing",
                "任务所属渠道不存在，跳过",
                channel_id = channel_id,
                tasks = tasks.len()
            );
            return stats;
        };

        let ids: Vec<String> = tasks.iter().map(|t| t.upstream_task_id.clone()).collect();
        let timeout = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let updates = match tokio::time::timeout(timeout, adaptor.fetch(&self.client, channel, &ids)).await {
            Ok(Ok(updates)) => updates,
            Ok(Err(e)) => {
                lwarn!(
                    "system",
                    LogStage::BackgroundTask,
                    LogComponent::TaskPoller,
                    "fetch_failed",
                    "任务状态查询失败",
                    channel_id = channel_id,
                    error = %e
                );
                return stats;
            }
            Err(_) => {
                lwarn!(
                    "system",
                    LogStage::BackgroundTask,
                    LogComponent::TaskPoller,
                    "fetch_timeout",
                    "任务状态查询超时",
                    channel_id = channel_id
                );
                return stats;
            }
        };

        let by_upstream: HashMap<&str, &Task> = tasks
            .iter()
            .map(|t| (t.upstream_task_id.as_str(), t))
            .collect();
        for update in &updates {
            let Some(task) = by_upstream.get(update.upstream_task_id.as_str()) else {
                continue;
            };
            let Some(status) = mapper.map(&update.status) else {
                ldebug!(
                    task.request_id,
                    LogStage::BackgroundTask,
                    LogComponent::TaskPoller,
                    "unknown_status",
                    "未知的上游任务状态，忽略",
                    task_id = %task.task_id,
                    status = %update.status
                );
                continue;
            };
            match self.apply_update(task, update, status).await {
                Ok(applied) => match (applied, status) {
                    (false, _) => {}
                    (true, TaskStatus::Success) => stats.succeeded += 1,
                    (true, TaskStatus::Failure) => stats.failed += 1,
                    (true, _) => stats.updated += 1,
                },
                Err(e) => {
                    lwarn!(
                        task.request_id,
                        LogStage::BackgroundTask,
                        LogComponent::TaskPoller,
                        "apply_update_failed",
                        "任务状态更新失败",
                        task_id = %task.task_id,
                        error = %e
                    );
                }
            }
        }
        stats
    }

    async fn apply_update(&self, task: &Task, update: &TaskUpdate, status: TaskStatus) -> Result<bool> {
        let repos = self.billing.repositories();
        match status {
            TaskStatus::Failure => {
                let reason = update.fail_reason.as_deref().unwrap_or("上游任务失败");
                self.fail_task(task, reason, false).await
            }
            TaskStatus::Success => {
                let actual = completed_quota(task, update);
                repos
                    .tasks
                    .update_task_progress(&task.task_id, task.status, "100%", Some(update.data.clone()))
                    .await?;
                let finished = repos
                    .tasks
                    .finish_task(&task.task_id, TaskStatus::Success, None, now_timestamp(), actual)
                    .await?;
                if finished {
                    self.forget_state(task).await;
                    self.billing
                        .adjust_settled(&task.request_id, actual, TASK_COMPLETED_CONTENT)
                        .await?;
                }
                Ok(finished)
            }
            TaskStatus::Submitted | TaskStatus::Queued | TaskStatus::InProgress => {
                let updated = repos
                    .tasks
                    .update_task_progress(&task.task_id, status, &update.progress, Some(update.data.clone()))
                    .await?;
                if updated && let Err(e) = self.states.update(task, status, &update.progress).await {
                    lwarn!(
                        task.request_id,
                        LogStage::Cache,
                        LogComponent::TaskPoller,
                        "state_cache_failed",
                        "任务状态写入缓存失败",
                        task_id = %task.task_id,
                        error = %e
                    );
                }
                Ok(updated)
            }
        }
    }

    /// 先按预扣额退还，再把任务转为失败；超时失败另写一条系统日志
    async fn fail_task(&self, task: &Task, reason: &str, system_log: bool) -> Result<bool> {
        let repos = self.billing.repositories();
        let refunded = self.billing.refund(&task.request_id, reason).await?;
        let finished = repos
            .tasks
            .finish_task(
                &task.task_id,
                TaskStatus::Failure,
                Some(reason.to_string()),
                now_timestamp(),
                task.quota,
            )
            .await?;
        if refunded && system_log {
            let mut entry = LogEntry::new(LogKind::System, &task.request_id, task.user_id);
            entry.token_id = Some(task.token_id);
            entry.channel_id = Some(task.channel_id);
            entry.model.clone_from(&task.model);
            entry.quota = task.quota;
            entry.content = format!("{reason}: {}", task.task_id);
            repos.logs.append_log(entry).await?;
        }
        if finished {
            self.forget_state(task).await;
            lwarn!(
                task.request_id,
                LogStage::BackgroundTask,
                LogComponent::TaskPoller,
                "task_failed",
                "任务失败，预扣已退还",
                task_id = %task.task_id,
                refunded = refunded,
                quota = task.quota,
                reason = reason
            );
        }
        Ok(finished)
    }

    /// 终态任务不再需要状态键
    async fn forget_state(&self, task: &Task) {
        if let Err(e) = self.states.finish(&task.platform, &task.task_id).await {
            lwarn!(
                task.request_id,
                LogStage::Cache,
                LogComponent::TaskPoller,
                "state_cache_failed",
                "任务状态键删除失败",
                task_id = %task.task_id,
                error = %e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{BillingSnapshot, PreConsumeRequest, Settlement};
    use crate::cache::{CacheBackend, MemoryCache};
    use crate::channel::Channel;
    use crate::config::{KeepAliveConfig, RuntimeOptions};
    use crate::keepalive::KeepAliveManager;
    use crate::store::{MemoryStore, Repositories, Token, User};
    use crate::types::{AccountStatus, BillingPreference, BillingSource, ProviderKind};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn task(snapshot: BillingSnapshot, quota: Quota, submit_time: i64) -> Task {
        Task {
            task_id: "task_1".into(),
            upstream_task_id: "up-1".into(),
            platform: "task".into(),
            request_id: "req-task".into(),
            user_id: 1,
            token_id: 2,
            channel_id: 3,
            action: "generate".into(),
            model: "video-1".into(),
            status: TaskStatus::Submitted,
            progress: String::new(),
            fail_reason: None,
            quota,
            billing_source: BillingSource::Wallet,
            submit_time,
            finish_time: None,
            data: json!({}),
            billing_snapshot: snapshot,
        }
    }

    fn update(data: serde_json::Value) -> TaskUpdate {
        TaskUpdate {
            upstream_task_id: "up-1".into(),
            status: "SUCCESS".into(),
            progress: "100%".into(),
            fail_reason: None,
            data,
        }
    }

    #[test]
    fn test_completed_quota_uses_saved_snapshot() {
        let per_call = BillingSnapshot {
            mode: BillingMode::PerCall,
            model_price: 0.5,
            quota_per_unit: 1_000.0,
            group_ratio: 2.0,
            user_ratio: 1.0,
            ..BillingSnapshot::default()
        };
        assert_eq!(completed_quota(&task(per_call, 700, 0), &update(json!({}))), 1_000);

        let usage = BillingSnapshot {
            mode: BillingMode::Usage,
            model_ratio: 2.0,
            completion_ratio: 1.0,
            group_ratio: 1.0,
            user_ratio: 1.0,
            ..BillingSnapshot::default()
        };
        let reported = update(json!({"usage": {"prompt_tokens": 10, "completion_tokens": 40, "total_tokens": 50}}));
        assert_eq!(completed_quota(&task(usage.clone(), 700, 0), &reported), 100);
        assert_eq!(completed_quota(&task(usage, 700, 0), &update(json!({}))), 700);
    }

    #[tokio::test]
    async fn test_timed_out_task_refunded_once() {
        let store = MemoryStore::new();
        store.insert_user(User {
            id: 1,
            email: "u@example.com".into(),
            group: "default".into(),
            quota: 10_000,
            status: AccountStatus::Enabled,
            billing_preference: BillingPreference::WalletOnly,
            warning_threshold: 0,
        });
        store.insert_token(Token {
            id: 2,
            user_id: 1,
            name: "t".into(),
            key_hash: "h".into(),
            remain_quota: 0,
            unlimited: true,
            allowed_groups: vec![],
            allowed_models: vec![],
            expires_at: None,
            status: AccountStatus::Enabled,
        });
        store.insert_channel(Channel::new(3, ProviderKind::Task, "https://task.example.com", "sk-t"));
        let repos = Repositories::from_store(store.clone());
        let billing = BillingEngine::new(repos.clone());

        billing
            .pre_consume(&PreConsumeRequest {
                request_id: "req-task",
                user_id: 1,
                token_id: 2,
                channel_id: Some(3),
                model: "video-1",
                quota: 5_000,
            })
            .await
            .unwrap();
        let settlement = Settlement {
            quota: 5_000,
            channel_id: Some(3),
            model: "video-1".into(),
            ..Settlement::default()
        };
        assert!(billing.post_consume("req-task", &settlement).await.unwrap());
        repos
            .tasks
            .insert_task(&task(BillingSnapshot::default(), 5_000, now_timestamp() - 3_600))
            .await
            .unwrap();
        assert_eq!(store.user_quota(1), Some(5_000));
        assert_eq!(store.channel(3).unwrap().used_quota, 5_000);

        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new(16));
        let keepalive = Arc::new(KeepAliveManager::new(Arc::clone(&backend), KeepAliveConfig::default()));
        let states = Arc::new(TaskStateCache::new(backend, Arc::clone(&keepalive), Duration::from_secs(600)));
        let stale = task(BillingSnapshot::default(), 5_000, now_timestamp() - 3_600);
        states.track(&stale).await.unwrap();
        assert_eq!(keepalive.len(), 1);

        let registry = ChannelRegistry::load(repos.channels.clone()).await.unwrap();
        let poller = TaskPoller::new(
            billing,
            registry,
            reqwest::Client::new(),
            TaskPlatforms::default(),
            Arc::clone(&states),
            Arc::new(OptionStore::new(RuntimeOptions::default())),
            TaskConfig::default(),
        );
        assert_eq!(poller.run_once().await.unwrap().timed_out, 1);
        assert_eq!(poller.run_once().await.unwrap(), PollStats::default());
        assert!(keepalive.is_empty());
        assert_eq!(states.get("task", "task_1").await.unwrap(), None);

        assert_eq!(store.user_quota(1), Some(10_000));
        assert_eq!(store.channel(3).unwrap().used_quota, 0);
        let stored = repos.tasks.get_task("task_1").await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failure);
        assert_eq!(stored.fail_reason.as_deref(), Some(TASK_TIMEOUT_REASON));
        let logs = store.all_logs().await;
        assert_eq!(logs.iter().filter(|l| l.kind == LogKind::System).count(), 1);
    }
}
