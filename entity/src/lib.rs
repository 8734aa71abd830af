//! # Entity 模块
//!
//! 网关持久化状态的 Sea-ORM 实体定义

pub mod channels;
pub mod consumption_logs;
pub mod reservations;
pub mod subscription_items;
pub mod tasks;
pub mod tokens;
pub mod users;

pub use channels::Entity as Channels;
pub use consumption_logs::Entity as ConsumptionLogs;
pub use reservations::Entity as Reservations;
pub use subscription_items::Entity as SubscriptionItems;
pub use tasks::Entity as Tasks;
pub use tokens::Entity as Tokens;
pub use users::Entity as Users;

#[cfg(test)]
mod tests;
