//! # 推理强度与思考模式
//!
//! 模型名后缀 `-low` 等被剥离并转为 `reasoning_effort`；`-thinking` 后缀开启思考模式。

/// 推理强度后缀，按匹配顺序排列
const EFFORT_SUFFIXES: &[(&str, &str)] = &[
    ("-minimal", "minimal"),
    ("-xhigh", "xhigh"),
    ("-low", "low"),
    ("-medium", "medium"),
    ("-high", "high"),
];

pub const THINKING_SUFFIX: &str = "-thinking";

/// 思考模式下 `max_tokens` 的下限
pub const MIN_THINKING_MAX_TOKENS: u32 = 1280;

/// 解析出的模型后缀
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSuffixes {
    /// 去掉后缀后的模型名
    pub model: String,
    pub effort: Option<String>,
    pub thinking: bool,
}

/// 剥离 `-thinking` 与推理强度后缀
#[must_use]
pub fn parse_model_suffixes(model: &str) -> ModelSuffixes {
    let (base, thinking) = match model.strip_suffix(THINKING_SUFFIX) {
        Some(base) if !base.is_empty() => (base, true),
        _ => (model, false),
    };
    for (suffix, effort) in EFFORT_SUFFIXES {
        if let Some(stripped) = base.strip_suffix(suffix).filter(|s| !s.is_empty()) {
            return ModelSuffixes {
                model: stripped.to_string(),
                effort: Some((*effort).to_string()),
                thinking,
            };
        }
    }
    ModelSuffixes {
        model: base.to_string(),
        effort: None,
        thinking,
    }
}

/// 推理强度对应的思考预算；`minimal` 不开启思考，`xhigh` 按 `high` 处理
#[must_use]
pub fn budget_for_effort(effort: &str) -> Option<u32> {
    match effort {
        "low" => Some(1280),
        "medium" => Some(2048),
        "high" | "xhigh" => Some(4096),
        _ => None,
    }
}

/// 思考预算反推推理强度
#[must_use]
pub const fn effort_for_budget(budget: u32) -> &'static str {
    match budget {
        0..=1280 => "low",
        1281..=2048 => "medium",
        _ => "high",
    }
}

/// `floor(max_tokens × percentage)`
#[must_use]
pub fn thinking_budget(max_tokens: u32, percentage: f64) -> u32 {
    (f64::from(max_tokens) * percentage.clamp(0.0, 1.0)).floor() as u32
}
