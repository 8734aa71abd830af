//! # 价格计算
//!
//! 请求开始时从运行时选项抓取倍率快照，预扣与结算都基于同一份快照，
//! 异步任务的快照随任务持久化。

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::RuntimeOptions;
use crate::config::options::lookup_model;
use crate::types::{Quota, Usage};

/// 计费模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    /// 按次固定价格
    PerCall,
    /// 按 token 用量
    Usage,
    /// 未配置价格与倍率
    #[default]
    Free,
}

impl BillingMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PerCall => "per_call",
            Self::Usage => "usage",
            Self::Free => "free",
        }
    }
}

/// 计费倍率快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BillingSnapshot {
    pub mode: BillingMode,
    pub model_price: f64,
    pub model_ratio: f64,
    pub completion_ratio: f64,
    pub cache_read_ratio: f64,
    pub cache_creation_ratio: f64,
    pub audio_ratio: f64,
    pub audio_completion_ratio: f64,
    pub group_ratio: f64,
    pub user_ratio: f64,
    pub quota_per_unit: f64,
}

fn dec(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

fn dec_u64(value: u64) -> Decimal {
    Decimal::from(value)
}

fn round_quota(value: Decimal) -> Quota {
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(Quota::MAX)
}

impl BillingSnapshot {
    /// 从当前运行时选项抓取模型与分组倍率
    ///
    /// 固定价格 > 0 时按次计费，否则模型倍率 > 0 时按量计费，否则免费。
    #[must_use]
    pub fn capture(
        options: &RuntimeOptions,
        model: &str,
        using_group: &str,
        user_group: &str,
    ) -> Self {
        let model_price = options.model_price(model).unwrap_or(0.0);
        let model_ratio = options.model_ratio(model).unwrap_or(0.0);
        let mode = if model_price > 0.0 {
            BillingMode::PerCall
        } else if model_ratio > 0.0 {
            BillingMode::Usage
        } else {
            BillingMode::Free
        };

        let ratio_or = |map: &HashMap<String, f64>, default: f64| lookup_model(map, model).copied().unwrap_or(default);

        Self {
            mode,
            model_price,
            model_ratio,
            completion_ratio: options.completion_ratio(model),
            cache_read_ratio: ratio_or(&options.cache_read_ratio, model_ratio),
            cache_creation_ratio: ratio_or(&options.cache_creation_ratio, model_ratio),
            audio_ratio: ratio_or(&options.audio_ratio, model_ratio),
            audio_completion_ratio: ratio_or(&options.audio_completion_ratio, 1.0),
            group_ratio: options.group_ratio(using_group),
            user_ratio: options.user_ratio(user_group),
            quota_per_unit: options.quota_per_unit,
        }
    }

    /// 按次价格对应的额度
    #[must_use]
    pub fn per_call_quota(&self) -> Quota {
        round_quota(
            dec(self.model_price)
                * dec(self.quota_per_unit)
                * dec(self.group_ratio)
                * dec(self.user_ratio),
        )
    }

    /// 按用量计算额度
    ///
    /// 任一倍率非零但结果不大于 0 时收取 1。
    #[must_use]
    pub fn usage_quota(&self, usage: &Usage) -> Quota {
        let model_ratio = dec(self.model_ratio);

        let prompt = dec_u64(usage.uncached_prompt_tokens()) * model_ratio
            + dec_u64(usage.cached_tokens) * dec(self.cache_read_ratio)
            + dec_u64(usage.cache_creation_tokens) * dec(self.cache_creation_ratio);
        let completion =
            dec_u64(usage.text_completion_tokens()) * model_ratio * dec(self.completion_ratio);
        let audio_ratio = dec(self.audio_ratio);
        let audio = dec_u64(usage.audio_prompt_tokens) * audio_ratio
            + dec_u64(usage.audio_completion_tokens)
                * audio_ratio
                * dec(self.audio_completion_ratio);

        let multiplier = dec(self.group_ratio) * dec(self.user_ratio);
        let quota = round_quota((prompt + completion + audio) * multiplier);

        let any_ratio = !model_ratio.is_zero() && !multiplier.is_zero();
        if any_ratio && quota <= 0 { 1 } else { quota }
    }

    /// 结算额度
    #[must_use]
    pub fn quota_for(&self, usage: &Usage) -> Quota {
        match self.mode {
            BillingMode::PerCall => self.per_call_quota(),
            BillingMode::Usage => self.usage_quota(usage),
            BillingMode::Free => 0,
        }
    }

    /// 预扣额度：按次直接取价格，按量以输入估算加上补全上限估算
    #[must_use]
    pub fn estimate_preconsume(&self, prompt_tokens: u64, completion_tokens: u64) -> Quota {
        match self.mode {
            BillingMode::PerCall => self.per_call_quota(),
            BillingMode::Usage => self.usage_quota(&Usage::new(prompt_tokens, completion_tokens)),
            BillingMode::Free => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn options() -> RuntimeOptions {
        RuntimeOptions {
            model_ratio: HashMap::from([("gpt-4o".to_string(), 1.25), ("claude-*".to_string(), 1.5)]),
            completion_ratio: HashMap::from([("gpt-4o".to_string(), 4.0)]),
            cache_read_ratio: HashMap::from([("gpt-4o".to_string(), 0.625)]),
            model_price: HashMap::from([("kling-v1".to_string(), 0.2)]),
            group_ratio: HashMap::from([("vip".to_string(), 0.5)]),
            ..RuntimeOptions::default()
        }
    }

    #[test]
    fn test_mode_selection() {
        let opts = options();
        assert_eq!(BillingSnapshot::capture(&opts, "kling-v1", "default", "default").mode, BillingMode::PerCall);
        assert_eq!(BillingSnapshot::capture(&opts, "gpt-4o", "default", "default").mode, BillingMode::Usage);
        assert_eq!(BillingSnapshot::capture(&opts, "unknown", "default", "default").mode, BillingMode::Free);
    }

    #[test]
    fn test_usage_quota_formula() {
        let snapshot = BillingSnapshot::capture(&options(), "gpt-4o", "default", "default");
        // 90 × 1.25 + 10 × 0.625 + 20 × 1.25 × 4
        let usage = Usage {
            cached_tokens: 10,
            ..Usage::new(100, 20)
        };
        assert_eq!(snapshot.usage_quota(&usage), 219);
    }

    #[test]
    fn test_group_ratio_and_rounding() {
        let snapshot = BillingSnapshot::capture(&options(), "gpt-4o", "vip", "default");
        // (5 × 1.25 + 2 × 1.25 × 4) × 0.5 = 8.125
        assert_eq!(snapshot.usage_quota(&Usage::new(5, 2)), 8);
    }

    #[test]
    fn test_minimum_one_when_ratio_nonzero() {
        let snapshot = BillingSnapshot::capture(&options(), "gpt-4o", "default", "default");
        assert_eq!(snapshot.usage_quota(&Usage::default()), 1);
    }

    #[test]
    fn test_per_call_quota() {
        let snapshot = BillingSnapshot::capture(&options(), "kling-v1", "vip", "default");
        assert_eq!(snapshot.per_call_quota(), 100_000);
        assert_eq!(snapshot.quota_for(&Usage::new(1_000, 1_000)), 100_000);
    }

    #[test]
    fn test_free_model_costs_nothing() {
        let snapshot = BillingSnapshot::capture(&options(), "local-llama", "default", "default");
        assert_eq!(snapshot.estimate_preconsume(1_000, 4_096), 0);
    }
}
