use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub type UserId = i64;
pub type TokenId = i64;
pub type ChannelId = i64;
pub type SubscriptionItemId = i64;

/// 额度，单位为百万分之一
pub type Quota = i64;
pub type TokenCount = u64;

/// 一个计费单位对应的额度
pub const QUOTA_PER_UNIT: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeoutSeconds(pub u64);

impl TimeoutSeconds {
    #[must_use]
    pub const fn new(seconds: u64) -> Self {
        Self(seconds)
    }

    #[must_use]
    pub const fn as_secs(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn as_duration(self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl fmt::Display for TimeoutSeconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

/// 百分比，取值 0.0 ~ 1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentage(pub f64);

impl Percentage {
    #[must_use]
    pub fn new(value: f64) -> Self {
        Self(value.clamp(0.0, 1.0))
    }

    #[must_use]
    pub const fn value(self) -> f64 {
        self.0
    }

    /// 对整数取百分比后向下取整
    #[must_use]
    pub fn floor_of(self, base: u32) -> u32 {
        (f64::from(base) * self.0).floor() as u32
    }
}

impl Default for Percentage {
    fn default() -> Self {
        Self(0.8)
    }
}

/// 用户或令牌的启用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Enabled,
    Disabled,
}

impl AccountStatus {
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// 用户的计费来源偏好
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BillingPreference {
    #[default]
    SubscriptionFirst,
    WalletFirst,
    SubscriptionOnly,
    WalletOnly,
}

impl BillingPreference {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SubscriptionFirst => "subscription_first",
            Self::WalletFirst => "wallet_first",
            Self::SubscriptionOnly => "subscription_only",
            Self::WalletOnly => "wallet_only",
        }
    }
}

impl FromStr for BillingPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscription_first" => Ok(Self::SubscriptionFirst),
            "wallet_first" => Ok(Self::WalletFirst),
            "subscription_only" => Ok(Self::SubscriptionOnly),
            "wallet_only" => Ok(Self::WalletOnly),
            other => Err(format!("unknown billing preference: {other}")),
        }
    }
}

/// 实际扣费来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BillingSource {
    Wallet,
    Subscription { item_id: SubscriptionItemId },
}

impl BillingSource {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Wallet => "wallet",
            Self::Subscription { .. } => "subscription",
        }
    }

    #[must_use]
    pub const fn subscription_item(&self) -> Option<SubscriptionItemId> {
        match self {
            Self::Wallet => None,
            Self::Subscription { item_id } => Some(*item_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_floor() {
        assert_eq!(Percentage::new(0.8).floor_of(1280), 1024);
        assert_eq!(Percentage::new(1.5).floor_of(100), 100);
    }

    #[test]
    fn test_billing_preference_round_trip() {
        for pref in [
            BillingPreference::SubscriptionFirst,
            BillingPreference::WalletFirst,
            BillingPreference::SubscriptionOnly,
            BillingPreference::WalletOnly,
        ] {
            assert_eq!(pref.as_str().parse::<BillingPreference>(), Ok(pref));
        }
    }
}
