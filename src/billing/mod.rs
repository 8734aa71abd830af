//! # 计费模块
//!
//! 两阶段计费：派发前按估算预扣，响应结束后按实际用量结算差额，失败时全额退还。
//! 用户、令牌与渠道的额度只在这里修改。

pub mod engine;
pub mod pricing;
pub mod reconcile;
pub mod source;
pub mod subscription;

pub use engine::{BillingEngine, PreConsumeRequest, Settlement, SharedBillingEngine};
pub use pricing::{BillingMode, BillingSnapshot};
pub use reconcile::{RECONCILE_REASON, Reconciler};
pub use source::{SourceReservation, reserve_from_source};
pub use subscription::SubscriptionMaintenance;
