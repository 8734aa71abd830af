//! # 实体定义测试

use crate::{channels, reservations, users};
use sea_orm::Set;

#[test]
fn test_user_active_model() {
    let user = users::ActiveModel {
        email: Set("ops@example.com".to_string()),
        group_name: Set("default".to_string()),
        quota: Set(500),
        ..Default::default()
    };

    assert_eq!(user.email.as_ref(), "ops@example.com");
    assert_eq!(user.quota.as_ref(), &500);
}

#[test]
fn test_reservation_active_model() {
    let reservation = reservations::ActiveModel {
        request_id: Set("req-1".to_string()),
        state: Set("open".to_string()),
        amount: Set(1000),
        ..Default::default()
    };

    assert_eq!(reservation.state.as_ref(), "open");
}

#[test]
fn test_channel_table_name() {
    use sea_orm::EntityName;
    assert_eq!(channels::Entity.table_name(), "channels");
}
