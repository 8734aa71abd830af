//! # 任务提交与查询
//!
//! 提交：选渠道 → 渠道并发检查 → 预扣 → 转发提交 → 结算 → 保存任务。
//! 提交成功即按预扣额结算，任务完成后由轮询按实际用量调整，失败则退还。

use axum::http::HeaderMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::state::TaskStateCache;
use crate::adaptor::task::{JsonTaskAdaptor, TaskAdaptor};
use crate::billing::{BillingSnapshot, PreConsumeRequest, Settlement};
use crate::channel::{Channel, SelectionRequest};
use crate::config::TaskConfig;
use crate::error::{RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::relay::{RelayInfo, RelayService};
use crate::store::{Repositories, Task, TaskStatus};
use crate::types::{ProviderKind, Quota, UserId, now_timestamp};
use crate::{linfo, lwarn};

/// 默认任务平台名
pub const DEFAULT_PLATFORM: &str = "task";

/// 平台名 → 任务适配器
#[derive(Clone)]
pub struct TaskPlatforms {
    adaptors: HashMap<String, Arc<dyn TaskAdaptor>>,
}

impl Default for TaskPlatforms {
    fn default() -> Self {
        let mut platforms = Self {
            adaptors: HashMap::new(),
        };
        platforms.register(Arc::new(JsonTaskAdaptor::new(DEFAULT_PLATFORM)));
        platforms
    }
}

impl TaskPlatforms {
    pub fn register(&mut self, adaptor: Arc<dyn TaskAdaptor>) {
        self.adaptors.insert(adaptor.platform().to_string(), adaptor);
    }

    /// 渠道 `other.platform` 指定平台，缺省为通用平台
    #[must_use]
    pub fn platform_of(channel: &Channel) -> &str {
        channel
            .other
            .get("platform")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_PLATFORM)
    }

    pub fn get(&self, platform: &str) -> Result<Arc<dyn TaskAdaptor>> {
        self.adaptors
            .get(platform)
            .cloned()
            .ok_or_else(|| RelayError::invalid_request(format!("未知的任务平台: {platform}")))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.adaptors.keys().map(String::as_str)
    }
}

/// 一次任务提交
#[derive(Debug)]
pub struct SubmitRequest {
    pub info: RelayInfo,
    pub headers: HeaderMap,
    pub body: Value,
}

/// 提交结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitResponse {
    pub task_id: String,
    /// 上游表示稍后查询，处理器返回 203
    #[serde(skip)]
    pub accepted_later: bool,
}

/// 返回给客户端的任务视图
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    pub task_id: String,
    pub platform: String,
    pub action: String,
    pub model: String,
    pub status: TaskStatus,
    pub progress: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    pub quota: Quota,
    pub submit_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<i64>,
    pub data: Value,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            platform: task.platform.clone(),
            action: task.action.clone(),
            model: task.model.clone(),
            status: task.status,
            progress: task.progress.clone(),
            fail_reason: task.fail_reason.clone(),
            quota: task.quota,
            submit_time: task.submit_time,
            finish_time: task.finish_time,
            data: task.data.clone(),
        }
    }
}

/// 任务管理器
pub struct TaskManager {
    relay: Arc<RelayService>,
    platforms: TaskPlatforms,
    states: Arc<TaskStateCache>,
    config: TaskConfig,
}

impl TaskManager {
    #[must_use]
    pub const fn new(
        relay: Arc<RelayService>,
        platforms: TaskPlatforms,
        states: Arc<TaskStateCache>,
        config: TaskConfig,
    ) -> Self {
        Self {
            relay,
            platforms,
            states,
            config,
        }
    }

    fn repos(&self) -> &Repositories {
        self.relay.billing().repositories()
    }

    /// 提交任务
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse> {
        let SubmitRequest {
            mut info,
            headers,
            body,
        } = request;
        let rid = info.request_id.clone();

        let selection = self
            .relay
            .selector()
            .select(&SelectionRequest {
                request_id: &rid,
                group: &info.using_group,
                model: &info.origin_model,
                retry_count: 0,
                tried: &HashSet::new(),
                token_id: info.token_id,
                client_ip: &info.client_ip,
                affinity: None,
            })
            .await?;
        if selection.channel.provider != ProviderKind::Task {
            return Err(RelayError::invalid_request(format!(
                "模型 {} 不支持异步任务",
                info.origin_model
            )));
        }
        let platform = TaskPlatforms::platform_of(&selection.channel).to_string();
        let adaptor = self.platforms.get(&platform)?;
        info.bind_channel(&selection);

        let scope = format!("task:ch:{}", selection.channel.id);
        let (admitted, permit) = self
            .relay
            .limiter()
            .check_concurrency(&scope, self.config.channel_submit_concurrency)
            .await;
        if !admitted {
            return Err(RelayError::rate_limited("渠道任务并发已满", 1));
        }

        let result = self
            .submit_on_channel(&mut info, adaptor.as_ref(), &platform, &headers, body)
            .await;
        permit.release().await;
        result
    }

    async fn submit_on_channel(
        &self,
        info: &mut RelayInfo,
        adaptor: &dyn TaskAdaptor,
        platform: &str,
        headers: &HeaderMap,
        body: Value,
    ) -> Result<SubmitResponse> {
        let rid = info.request_id.clone();
        let snapshot = BillingSnapshot::capture(&info.options, &info.origin_model, &info.using_group, &info.user_group);
        let estimate = snapshot.estimate_preconsume(
            info.prompt_tokens,
            u64::from(info.options.preconsume_completion_tokens),
        );
        let billing = self.relay.billing();
        let reservation = billing
            .pre_consume(&PreConsumeRequest {
                request_id: &rid,
                user_id: info.user_id,
                token_id: info.token_id,
                channel_id: Some(info.channel_id),
                model: &info.origin_model,
                quota: estimate,
            })
            .await?;
        info.pre_consumed_quota = reservation.quota;
        info.billing_source = Some(reservation.source);

        let action = body
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("generate")
            .to_string();
        let timeout = Duration::from_secs(self.relay.config().timeout_secs.max(1));
        let submitted = match tokio::time::timeout(timeout, adaptor.submit(self.relay.client(), headers, info, body)).await {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };
        let submission = match submitted {
            Ok(submission) => submission,
            Err(e) => {
                self.refund_logged(&rid, &e.to_string()).await;
                return Err(e);
            }
        };

        let task_id = format!("task_{}", uuid::Uuid::new_v4().simple());
        let task = Task {
            task_id: task_id.clone(),
            upstream_task_id: submission.upstream_task_id,
            platform: platform.to_string(),
            request_id: rid.clone(),
            user_id: info.user_id,
            token_id: info.token_id,
            channel_id: info.channel_id,
            action,
            model: info.origin_model.clone(),
            status: TaskStatus::Submitted,
            progress: String::new(),
            fail_reason: None,
            quota: reservation.quota,
            billing_source: reservation.source,
            submit_time: now_timestamp(),
            finish_time: None,
            data: submission.data,
            billing_snapshot: snapshot,
        };
        let settlement = Settlement {
            quota: reservation.quota,
            channel_id: Some(info.channel_id),
            model: info.origin_model.clone(),
            content: format!("task={task_id} platform={platform}"),
            ..Settlement::default()
        };
        match billing.post_consume(&rid, &settlement).await {
            Ok(true) => {}
            Ok(false) => {
                lwarn!(
                    rid,
                    LogStage::Billing,
                    LogComponent::TaskManager,
                    "reservation_not_open",
                    "任务预扣已不在进行中，跳过提交结算",
                    task_id = %task_id
                );
            }
            Err(e) => {
                self.refund_logged(&rid, "任务提交结算失败").await;
                return Err(e);
            }
        }

        if let Err(e) = self.repos().tasks.insert_task(&task).await {
            self.refund_logged(&rid, "任务保存失败").await;
            return Err(e);
        }
        if let Err(e) = self.states.track(&task).await {
            lwarn!(
                rid,
                LogStage::Cache,
                LogComponent::TaskManager,
                "state_cache_failed",
                "任务状态写入缓存失败",
                task_id = %task_id,
                error = %e
            );
        }

        linfo!(
            rid,
            LogStage::Response,
            LogComponent::TaskManager,
            "task_submitted",
            "任务已提交",
            task_id = %task_id,
            platform = platform,
            channel_id = info.channel_id,
            quota = reservation.quota,
            accepted_later = submission.accepted_later
        );
        Ok(SubmitResponse {
            task_id,
            accepted_later: submission.accepted_later,
        })
    }

    /// 退还失败只记录日志，遗留的预扣由对账任务处理
    async fn refund_logged(&self, rid: &str, reason: &str) {
        if let Err(e) = self.relay.billing().refund(rid, reason).await {
            lwarn!(
                rid,
                LogStage::Billing,
                LogComponent::TaskManager,
                "refund_failed",
                "任务提交失败后退还失败，等待对账",
                reason = reason,
                error = %e
            );
        }
    }

    /// 查询当前用户的单个任务
    pub async fn fetch(&self, user_id: UserId, task_id: &str) -> Result<TaskView> {
        self.repos()
            .tasks
            .get_task(task_id)
            .await?
            .filter(|task| task.user_id == user_id)
            .map(|task| TaskView::from(&task))
            .ok_or_else(|| RelayError::not_found(format!("任务不存在: {task_id}")))
    }

    /// 批量查询当前用户的任务，不存在的 id 被忽略
    pub async fn list(&self, user_id: UserId, task_ids: &[String]) -> Result<Vec<TaskView>> {
        let tasks = self.repos().tasks.list_tasks(user_id, task_ids).await?;
        Ok(tasks.iter().map(TaskView::from).collect())
    }
}
