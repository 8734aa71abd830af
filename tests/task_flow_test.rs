//! # 异步任务集成测试
//!
//! 提交 → 轮询 → 查询，以及上游失败后的退还。

mod common;

use async_trait::async_trait;
use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{Gateway, USER_ID, body_json, token, user};
use relay_gateway::cache::CacheBackend;
use relay_gateway::channel::Channel;
use relay_gateway::config::RuntimeOptions;
use relay_gateway::error::{RelayError, Result};
use relay_gateway::store::{LogKind, MemoryStore, Repositories, Task, TaskRepository, TaskStatus};
use relay_gateway::types::{BillingPreference, ProviderKind, Quota, UserId};

const WALLET: i64 = 100_000;
const TASK_PRICE_QUOTA: i64 = 5_000;

fn task_store(upstream: &MockServer) -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    store.insert_user(user(WALLET, BillingPreference::WalletFirst));
    store.insert_token(token(WALLET));
    let mut channel = Channel::new(60, ProviderKind::Task, upstream.uri(), "sk-task");
    channel.models = vec!["video-1".into()];
    store.insert_channel(channel);
    store
}

/// 0.005 × 1_000_000 = 每次 5000
fn task_options() -> RuntimeOptions {
    RuntimeOptions {
        model_price: HashMap::from([("video-1".to_string(), 0.005)]),
        ..RuntimeOptions::default()
    }
}

async fn task_gateway(upstream: &MockServer) -> Gateway {
    Gateway::start(task_store(upstream), task_options()).await
}

async fn state_key_exists(gateway: &Gateway, task_id: &str) -> bool {
    let backend = gateway.services.resources().cache().backend;
    backend.exists(&format!("task:task:{task_id}")).await.unwrap()
}

/// 保存任务总是失败，其余操作交给内存存储
struct UnwritableTasks(Arc<MemoryStore>);

#[async_trait]
impl TaskRepository for UnwritableTasks {
    async fn insert_task(&self, _task: &Task) -> Result<()> {
        Err(RelayError::database("tasks table is read-only"))
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.0.get_task(task_id).await
    }

    async fn list_tasks(&self, user_id: UserId, task_ids: &[String]) -> Result<Vec<Task>> {
        self.0.list_tasks(user_id, task_ids).await
    }

    async fn unfinished_tasks(&self, platform: &str, limit: u64) -> Result<Vec<Task>> {
        self.0.unfinished_tasks(platform, limit).await
    }

    async fn update_task_progress(
        &self,
        task_id: &str,
        status: TaskStatus,
        progress: &str,
        data: Option<serde_json::Value>,
    ) -> Result<bool> {
        self.0.update_task_progress(task_id, status, progress, data).await
    }

    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        fail_reason: Option<String>,
        finish_time: i64,
        quota: Quota,
    ) -> Result<bool> {
        self.0
            .finish_task(task_id, status, fail_reason, finish_time, quota)
            .await
    }
}

async fn mount_submit(upstream: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/video-1/submit"))
        .and(body_partial_json(json!({"model": "video-1", "prompt": "a cat"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"task_id": "up-77"})))
        .expect(1)
        .mount(upstream)
        .await;
}

async fn submit(gateway: &Gateway) -> String {
    let response = gateway
        .post_json("/video-1/submit", &json!({"prompt": "a cat"}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    body["task_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_submit_poll_and_fetch() {
    let upstream = MockServer::start().await;
    mount_submit(&upstream).await;
    Mock::given(method("POST"))
        .and(path("/task/list-by-condition"))
        .and(body_partial_json(json!({"ids": ["up-77"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"task_id": "up-77", "status": "SUCCESS", "progress": "100%", "url": "https://cdn.example/v.mp4"}
        ])))
        .mount(&upstream)
        .await;
    let gateway = task_gateway(&upstream).await;

    let task_id = submit(&gateway).await;
    assert!(task_id.starts_with("task_"));
    // 提交成功即按预扣额结算
    assert_eq!(gateway.store.user_quota(USER_ID), Some(WALLET - TASK_PRICE_QUOTA));
    // 未结束的任务在缓存中保留状态键并由保活续期
    assert!(state_key_exists(&gateway, &task_id).await);
    assert_eq!(gateway.services.keepalive().len(), 1);

    let pending = body_json(gateway.post_json("/video-1/fetch", &json!({"task_id": task_id})).await).await;
    assert_eq!(pending["status"], "submitted");

    let stats = gateway.services.task_poller().run_once().await.unwrap();
    assert_eq!(stats.succeeded, 1);
    assert!(!state_key_exists(&gateway, &task_id).await);
    assert!(gateway.services.keepalive().is_empty());

    let done = body_json(gateway.post_json("/video-1/fetch", &json!({"task_id": task_id})).await).await;
    assert_eq!(done["status"], "success");
    assert_eq!(done["progress"], "100%");
    assert_eq!(done["quota"], TASK_PRICE_QUOTA);
    assert_eq!(gateway.store.user_quota(USER_ID), Some(WALLET - TASK_PRICE_QUOTA));

    let listed = body_json(
        gateway
            .post_json(
                "/video-1/task/list-by-condition",
                &json!({"ids": [task_id, "task_missing"]}),
            )
            .await,
    )
    .await;
    assert_eq!(listed.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_upstream_failure_refunds_wallet() {
    let upstream = MockServer::start().await;
    mount_submit(&upstream).await;
    Mock::given(method("POST"))
        .and(path("/task/list-by-condition"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "up-77", "state": "FAILURE", "error": {"message": "content rejected"}}]
        })))
        .mount(&upstream)
        .await;
    let gateway = task_gateway(&upstream).await;

    let task_id = submit(&gateway).await;
    assert_eq!(gateway.store.user_quota(USER_ID), Some(WALLET - TASK_PRICE_QUOTA));

    let stats = gateway.services.task_poller().run_once().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(gateway.store.user_quota(USER_ID), Some(WALLET));
    assert!(!state_key_exists(&gateway, &task_id).await);
    assert!(gateway.services.keepalive().is_empty());

    let view = body_json(gateway.post_json("/video-1/fetch", &json!({"task_id": task_id})).await).await;
    assert_eq!(view["status"], "failure");
    assert_eq!(view["fail_reason"], "content rejected");

    // 再次轮询不会重复退还
    gateway.services.task_poller().run_once().await.unwrap();
    assert_eq!(gateway.store.user_quota(USER_ID), Some(WALLET));
}

#[tokio::test]
async fn test_fetch_unknown_task_is_not_found() {
    let upstream = MockServer::start().await;
    let gateway = task_gateway(&upstream).await;

    let response = gateway
        .post_json("/video-1/fetch", &json!({"task_id": "task_nope"}))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unsaved_task_refunds_settled_quota() {
    let upstream = MockServer::start().await;
    mount_submit(&upstream).await;
    let store = task_store(&upstream);
    let mut repos = Repositories::from_store(Arc::clone(&store));
    repos.tasks = Arc::new(UnwritableTasks(Arc::clone(&store)));
    let gateway = Gateway::start_with_repos(store, repos, task_options(), |_| {}).await;

    let response = gateway
        .post_json("/video-1/submit", &json!({"prompt": "a cat"}))
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // 提交时已结算，保存失败后按结算额退还
    assert_eq!(gateway.store.user_quota(USER_ID), Some(WALLET));
    let logs = gateway.store.all_logs().await;
    assert_eq!(logs.iter().filter(|l| l.kind == LogKind::Consume).count(), 1);
    assert_eq!(logs.iter().filter(|l| l.kind == LogKind::Refund).count(), 1);
    assert!(gateway.services.keepalive().is_empty());
}
