//! # 运行时选项
//!
//! 倍率、价格、角色映射等可热更新的选项。读者通过原子指针读取不可变快照，
//! 写者整体替换快照。

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// 亲和性规则的 key 来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AffinityKeySource {
    /// 请求上下文中的整数字段：`user_id` / `token_id`
    ContextInt(String),
    /// 请求上下文中的字符串字段：`client_ip` / `user_group` / `origin_model`
    ContextString(String),
    /// 请求体中的 JSON 路径，例如 `metadata.user_id` 或 `messages[0].content`
    JsonPath(String),
}

/// 亲和性规则配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityRuleConfig {
    pub name: String,
    /// 模型名正则，任一匹配即可
    pub model_patterns: Vec<String>,
    /// 可选的路径正则
    #[serde(default)]
    pub path_pattern: Option<String>,
    pub key_source: AffinityKeySource,
    /// key 中是否包含使用分组
    #[serde(default)]
    pub include_using_group: bool,
    pub ttl_secs: u64,
}

/// 运行时选项快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// 跨渠道重试次数上限
    pub retry_times: u32,
    /// 一个计费单位对应的额度
    pub quota_per_unit: f64,
    pub model_ratio: HashMap<String, f64>,
    pub completion_ratio: HashMap<String, f64>,
    pub cache_read_ratio: HashMap<String, f64>,
    pub cache_creation_ratio: HashMap<String, f64>,
    pub audio_ratio: HashMap<String, f64>,
    pub audio_completion_ratio: HashMap<String, f64>,
    /// 按次计费价格（计费单位）
    pub model_price: HashMap<String, f64>,
    /// 使用分组倍率
    pub group_ratio: HashMap<String, f64>,
    /// 用户所在分组的个人倍率
    pub user_group_ratio: HashMap<String, f64>,
    /// `{模型前缀 → {源角色 → 目标角色}}`
    pub role_mapping: HashMap<String, HashMap<String, String>>,
    /// `-thinking` 后缀模型的思考预算占 max_tokens 的比例
    pub thinking_budget_percentage: f64,
    /// 未指定 max_tokens 时预扣使用的补全 token 数
    pub preconsume_completion_tokens: u32,
    /// 上游任务状态 → 规范状态 (`success` / `failure` / `in_progress` / `queued`)
    pub task_status_mapping: HashMap<String, String>,
    pub affinity_rules: Vec<AffinityRuleConfig>,
    /// 是否响应 `X-Test-Traffic: true` 的模拟请求
    pub mock_traffic_enabled: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            retry_times: 3,
            quota_per_unit: crate::types::QUOTA_PER_UNIT,
            model_ratio: HashMap::new(),
            completion_ratio: HashMap::new(),
            cache_read_ratio: HashMap::new(),
            cache_creation_ratio: HashMap::new(),
            audio_ratio: HashMap::new(),
            audio_completion_ratio: HashMap::new(),
            model_price: HashMap::new(),
            group_ratio: HashMap::new(),
            user_group_ratio: HashMap::new(),
            role_mapping: HashMap::new(),
            thinking_budget_percentage: 0.8,
            preconsume_completion_tokens: 4096,
            task_status_mapping: HashMap::new(),
            affinity_rules: Vec::new(),
            mock_traffic_enabled: false,
        }
    }
}

/// 按模型名查找：精确匹配优先，其次是以 `*` 结尾的最长前缀
#[must_use]
pub fn lookup_model<'a, V>(map: &'a HashMap<String, V>, model: &str) -> Option<&'a V> {
    if let Some(value) = map.get(model) {
        return Some(value);
    }
    map.iter()
        .filter_map(|(pattern, value)| {
            pattern
                .strip_suffix('*')
                .filter(|prefix| model.starts_with(prefix))
                .map(|prefix| (prefix.len(), value))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, value)| value)
}

impl RuntimeOptions {
    /// 校验选项
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.thinking_budget_percentage) {
            return Err("options.thinking_budget_percentage must be within [0, 1]".to_string());
        }
        if self.quota_per_unit <= 0.0 {
            return Err("options.quota_per_unit must be positive".to_string());
        }
        for rule in &self.affinity_rules {
            if rule.model_patterns.is_empty() {
                return Err(format!("affinity rule {} has no model pattern", rule.name));
            }
            for pattern in rule.model_patterns.iter().chain(rule.path_pattern.iter()) {
                regex::Regex::new(pattern)
                    .map_err(|e| format!("affinity rule {}: invalid regex {pattern}: {e}", rule.name))?;
            }
        }
        Ok(())
    }

    /// 分组倍率，缺省为 1
    #[must_use]
    pub fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratio.get(group).copied().unwrap_or(1.0)
    }

    /// 用户倍率，缺省为 1
    #[must_use]
    pub fn user_ratio(&self, user_group: &str) -> f64 {
        self.user_group_ratio.get(user_group).copied().unwrap_or(1.0)
    }

    #[must_use]
    pub fn model_ratio(&self, model: &str) -> Option<f64> {
        lookup_model(&self.model_ratio, model).copied()
    }

    #[must_use]
    pub fn model_price(&self, model: &str) -> Option<f64> {
        lookup_model(&self.model_price, model).copied()
    }

    #[must_use]
    pub fn completion_ratio(&self, model: &str) -> f64 {
        lookup_model(&self.completion_ratio, model)
            .copied()
            .unwrap_or(1.0)
    }
}

/// 运行时选项存储
pub struct OptionStore {
    current: ArcSwap<RuntimeOptions>,
}

impl OptionStore {
    #[must_use]
    pub fn new(initial: RuntimeOptions) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// 当前快照
    #[must_use]
    pub fn snapshot(&self) -> Arc<RuntimeOptions> {
        self.current.load_full()
    }

    /// 发布新快照
    pub fn publish(&self, options: RuntimeOptions) {
        self.current.store(Arc::new(options));
    }
}

impl Default for OptionStore {
    fn default() -> Self {
        Self::new(RuntimeOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lookup_prefers_exact_then_longest_prefix() {
        let mut map = HashMap::new();
        map.insert("gpt-4*".to_string(), 15.0);
        map.insert("gpt-4o*".to_string(), 2.5);
        map.insert("gpt-4o-mini".to_string(), 0.075);

        assert_eq!(lookup_model(&map, "gpt-4o-mini"), Some(&0.075));
        assert_eq!(lookup_model(&map, "gpt-4o-2024-08-06"), Some(&2.5));
        assert_eq!(lookup_model(&map, "gpt-4-turbo"), Some(&15.0));
        assert_eq!(lookup_model(&map, "claude-3"), None);
    }

    #[test]
    fn test_publish_replaces_snapshot() {
        let store = OptionStore::default();
        let before = store.snapshot();
        let mut next = (*before).clone();
        next.retry_times = 7;
        store.publish(next);

        assert_eq!(before.retry_times, 3);
        assert_eq!(store.snapshot().retry_times, 7);
    }

    #[test]
    fn test_validate_rejects_bad_regex() {
        let mut options = RuntimeOptions::default();
        options.affinity_rules.push(AffinityRuleConfig {
            name: "bad".into(),
            model_patterns: vec!["(".into()],
            path_pattern: None,
            key_source: AffinityKeySource::ContextInt("user_id".into()),
            include_using_group: false,
            ttl_secs: 60,
        });
        assert!(options.validate().is_err());
    }
}
