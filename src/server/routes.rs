//! # 路由配置

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use std::any::Any;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use super::auth::{authenticate, require_admin};
use super::handlers;
use super::state::ServerState;
use crate::lerror;
use crate::logging::{LogComponent, LogStage};
use crate::relay::{HEADER_REQUEST_ID, new_request_id, panic_response};
use crate::traffic::track_in_flight;
use crate::types::RelayFormat;

/// 处理器 panic 时的通用 500
fn handle_panic(_payload: Box<dyn Any + Send + 'static>) -> Response {
    let rid = new_request_id();
    lerror!(
        rid,
        LogStage::Internal,
        LogComponent::ServerSetup,
        "handler_panic",
        "请求处理器 panic"
    );
    panic_response(RelayFormat::OpenAi, &rid)
}

/// 没有携带请求 ID 的响应补一个
async fn ensure_request_id(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    if !response.headers().contains_key(HEADER_REQUEST_ID)
        && let Ok(value) = HeaderValue::from_str(&new_request_id())
    {
        response.headers_mut().insert(HEADER_REQUEST_ID, value);
    }
    response
}

/// 需要令牌认证的转发路由
fn relay_routes(state: &ServerState) -> Router<ServerState> {
    Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/v1/rerank", post(handlers::rerank))
        .route("/v1/images/generations", post(handlers::image_generations))
        .route("/v1/images/edits", post(handlers::image_edits))
        .route("/v1/audio/speech", post(handlers::audio_speech))
        .route("/v1/audio/transcriptions", post(handlers::audio_transcriptions))
        .route("/v1/audio/translations", post(handlers::audio_translations))
        .route("/v1/responses", post(handlers::responses))
        .route("/v1/messages", post(handlers::messages))
        .route(
            "/v1beta/models/{*target}",
            get(handlers::gemini).post(handlers::gemini),
        )
        .route("/v1/realtime", get(handlers::realtime))
        .route("/{model}/submit", post(handlers::task_submit))
        .route("/{model}/fetch", post(handlers::task_fetch))
        .route("/{model}/task/list-by-condition", post(handlers::task_list))
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate))
}

/// 管理令牌保护的只读接口
fn admin_routes(state: &ServerState) -> Router<ServerState> {
    Router::new()
        .route("/api/recent-calls", get(handlers::recent_calls))
        .route("/api/recent-calls/{id}", get(handlers::recent_call))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin))
}

/// 创建全部路由
pub fn create_router(state: ServerState) -> Router {
    let max_body_bytes = state.resources().config().server.max_body_bytes;
    Router::new()
        .route("/health", get(handlers::health))
        .merge(relay_routes(&state))
        .merge(admin_routes(&state))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(middleware::from_fn_with_state(state.traffic(), track_in_flight))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn(ensure_request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
