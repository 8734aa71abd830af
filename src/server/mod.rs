//! # HTTP 入口
//!
//! axum 路由、令牌认证与各协议入口的处理器。

pub mod auth;
pub mod handlers;
pub mod routes;
pub mod state;

pub use auth::{AuthContext, hash_key};
pub use routes::create_router;
pub use state::ServerState;

use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::error::{RelayError, Result};
use crate::linfo;
use crate::logging::{LogComponent, LogStage};
use crate::shutdown::ShutdownCoordinator;

/// 监听并服务，直到收到关闭通知
pub async fn serve(listener: TcpListener, router: Router, shutdown: ShutdownCoordinator) -> Result<()> {
    let addr = listener.local_addr()?;
    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::ServerSetup,
        "server_start",
        "网关开始监听",
        addr = %addr
    );
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.wait().await })
    .await
    .map_err(|e| RelayError::internal_with_source("HTTP 服务异常退出", e))
}
