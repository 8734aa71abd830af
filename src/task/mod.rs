//! # 异步任务
//!
//! 生成类平台的提交、查询与后台轮询结算。

pub mod manager;
pub mod poller;
pub mod state;
pub mod status;

pub use manager::{SubmitRequest, SubmitResponse, TaskManager, TaskPlatforms, TaskView};
pub use poller::{PollStats, TASK_TIMEOUT_REASON, TaskPoller};
pub use state::TaskStateCache;
pub use status::StatusMapper;
