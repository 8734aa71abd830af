//! # Relay Gateway
//!
//! 多租户 LLM API 网关核心库：协议转换、渠道选择与故障转移、限流、两阶段计费与异步任务。

pub mod adaptor;
pub mod affinity;
pub mod app;
pub mod billing;
pub mod cache;
pub mod channel;
pub mod config;
pub mod database;
pub mod error;
pub mod keepalive;
pub mod logging;
pub mod ratelimit;
pub mod recent_calls;
pub mod relay;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod task;
pub mod traffic;
pub mod types;

pub use config::AppConfig;
pub use error::{RelayError, Result};
