//! # 集成测试公共夹具
//!
//! 内存存储 + 内存缓存搭建完整网关，上游由 wiremock 模拟，
//! 请求通过 `tower::ServiceExt::oneshot` 直接驱动路由。

#![allow(dead_code)]

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, Response, header};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use relay_gateway::AppConfig;
use relay_gateway::app::{AppResources, AppServices};
use relay_gateway::cache::{CacheHandles, MemoryCache};
use relay_gateway::channel::Channel;
use relay_gateway::config::RuntimeOptions;
use relay_gateway::server::{ServerState, create_router, hash_key};
use relay_gateway::store::{MemoryStore, Repositories, Token, User};
use relay_gateway::types::{AccountStatus, BillingPreference, ProviderKind, Quota};

pub const API_KEY: &str = "sk-relay-integration";
pub const USER_ID: i64 = 1;
pub const TOKEN_ID: i64 = 100;

pub fn user(quota: Quota, preference: BillingPreference) -> User {
    User {
        id: USER_ID,
        email: "tenant@example.com".into(),
        group: "default".into(),
        quota,
        status: AccountStatus::Enabled,
        billing_preference: preference,
        warning_threshold: 0,
    }
}

pub fn token(remain_quota: Quota) -> Token {
    Token {
        id: TOKEN_ID,
        user_id: USER_ID,
        name: "integration".into(),
        key_hash: hash_key(API_KEY),
        remain_quota,
        unlimited: false,
        allowed_groups: vec![],
        allowed_models: vec![],
        expires_at: None,
        status: AccountStatus::Enabled,
    }
}

/// 服务 `gpt-4o` 的 OpenAI 渠道
pub fn openai_channel(id: i64, base_url: &str, priority: i64) -> Channel {
    let mut channel = Channel::new(id, ProviderKind::OpenAi, base_url, format!("sk-upstream-{id}"));
    channel.models = vec!["gpt-4o".into()];
    channel.priority = priority;
    channel
}

/// 已装配好的网关
pub struct Gateway {
    pub store: Arc<MemoryStore>,
    pub services: Arc<AppServices>,
    router: Router,
}

impl Gateway {
    /// 以给定存储与运行时选项启动，不启动后台任务
    pub async fn start(store: Arc<MemoryStore>, options: RuntimeOptions) -> Self {
        Self::start_with(store, options, |_| {}).await
    }

    /// 启动前可再调整配置
    pub async fn start_with<F>(store: Arc<MemoryStore>, options: RuntimeOptions, configure: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let repos = Repositories::from_store(Arc::clone(&store));
        Self::start_with_repos(store, repos, options, configure).await
    }

    /// 以自定义仓储启动，用于注入故障
    pub async fn start_with_repos<F>(
        store: Arc<MemoryStore>,
        repos: Repositories,
        options: RuntimeOptions,
        configure: F,
    ) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = AppConfig::default();
        config.relay.timeout_secs = 10;
        config.server.admin_token = Some("admin-secret".into());
        config.options = options;
        configure(&mut config);

        let cache = CacheHandles {
            backend: Arc::new(MemoryCache::new(1_000)),
            redis: None,
        };
        let resources = AppResources::with_parts(
            Arc::new(config),
            repos,
            cache,
        );
        let services = AppServices::initialize(&resources).await.unwrap();
        let router = create_router(ServerState::new(Arc::clone(&services)));
        Self {
            store,
            services,
            router,
        }
    }

    /// 供需要真实连接的用例挂到监听端口上
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// 以测试令牌 POST 一个 JSON 请求
    pub async fn post_json(&self, path: &str, body: &Value) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {API_KEY}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    pub async fn get(&self, path: &str, bearer: Option<&str>) -> Response<Body> {
        let mut builder = Request::builder().method("GET").uri(path);
        if let Some(bearer) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {bearer}"));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// 结算在后台任务中完成，轮询直到条件成立
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(condition(), "条件在超时前未满足");
}

/// 非流式聊天补全响应
pub fn chat_completion(text: &str, prompt: u64, completion: u64) -> Value {
    serde_json::json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion
        }
    })
}
