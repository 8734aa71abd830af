//! # 渠道模块
//!
//! 渠道模型、注册表快照、选择算法与自动禁用策略

pub mod disable;
pub mod model;
pub mod registry;
pub mod selector;

pub use disable::{disable_reason, is_insufficient_quota, should_disable};
pub use model::{
    ALL_KEYS_DISABLED, Channel, ChannelStatus, DisableOutcome, INSUFFICIENT_QUOTA_PREFIX, KeyState,
    KeyStatus, ModelCaps,
};
pub use registry::{ChannelRegistry, RegistrySnapshot};
pub use selector::{ChannelSelector, Selection, SelectionRequest};
