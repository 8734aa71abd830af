//! # 应用装配
//!
//! 资源层（配置、存储、缓存）→ 服务层 → 后台任务层，逐层构建。

pub mod periodic;
pub mod resources;
pub mod service_registry;
pub mod task_scheduler;
pub mod tasks;

pub use periodic::PeriodicTask;
pub use resources::AppResources;
pub use service_registry::AppServices;
pub use task_scheduler::{ScheduledTask, TaskScheduler};
pub use tasks::{AppTasks, TaskType};
