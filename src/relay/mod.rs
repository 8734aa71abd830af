//! # 转发层
//!
//! 单次请求的上下文、响应通道、重试策略、错误渲染与编排器。

pub mod error_body;
pub mod info;
pub mod mock;
pub mod orchestrator;
pub mod realtime;
pub mod retry;
pub mod sink;

pub use error_body::{ClientError, HEADER_REQUEST_ID, panic_response};
pub use info::{RelayInfo, new_request_id};
pub use orchestrator::{ClientPayload, RelayDeps, RelayRequest, RelayService};
pub use retry::{RetryDecision, RetryPolicy};
pub use sink::{BodyChunk, ResponseHead, ResponseSink, SinkReceiver, channel};
