//! # 渠道亲和缓存
//!
//! 按规则从请求中提取指纹，把指纹绑定到上次成功的渠道，带每条目 TTL 与容量上限。

use arc_swap::ArcSwap;
use moka::Expiry;
use moka::future::Cache;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{AffinityKeySource, AffinityRuleConfig};
use crate::error::{RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::types::{ChannelId, TokenId, UserId};
use crate::{ldebug, lwarn};

#[derive(Debug, Clone, Copy)]
struct Binding {
    channel_id: ChannelId,
    ttl: Duration,
}

struct BindingExpiry;

impl Expiry<String, Binding> for BindingExpiry {
    fn expire_after_create(&self, _key: &String, value: &Binding, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Binding,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// 编译后的规则
#[derive(Debug)]
struct AffinityRule {
    name: String,
    models: Vec<Regex>,
    path: Option<Regex>,
    source: AffinityKeySource,
    include_using_group: bool,
    ttl: Duration,
}

impl AffinityRule {
    fn compile(config: &AffinityRuleConfig) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| {
                RelayError::config_with_source(format!("亲和规则 {} 正则无效: {pattern}", config.name), e)
            })
        };
        Ok(Self {
            name: config.name.clone(),
            models: config
                .model_patterns
                .iter()
                .map(|p| compile(p.as_str()))
                .collect::<Result<_>>()?,
            path: config.path_pattern.as_deref().map(compile).transpose()?,
            source: config.key_source.clone(),
            include_using_group: config.include_using_group,
            ttl: Duration::from_secs(config.ttl_secs.max(1)),
        })
    }

    fn matches(&self, model: &str, path: &str) -> bool {
        self.models.iter().any(|re| re.is_match(model))
            && self.path.as_ref().is_none_or(|re| re.is_match(path))
    }
}

struct RuleSet {
    source: Vec<AffinityRuleConfig>,
    rules: Vec<AffinityRule>,
}

/// 提取亲和指纹所需的请求上下文
#[derive(Debug, Clone, Copy)]
pub struct AffinityContext<'a> {
    pub user_id: UserId,
    pub token_id: TokenId,
    pub client_ip: &'a str,
    pub user_group: &'a str,
    pub using_group: &'a str,
    pub model: &'a str,
    pub path: &'a str,
    pub body: Option<&'a Value>,
}

/// 命中规则后的亲和键
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityKey {
    pub key: String,
    pub ttl: Duration,
}

/// 亲和缓存
pub struct AffinityCache {
    cache: Cache<String, Binding>,
    rules: ArcSwap<RuleSet>,
}

impl AffinityCache {
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity)
                .expire_after(BindingExpiry)
                .build(),
            rules: ArcSwap::from_pointee(RuleSet {
                source: Vec::new(),
                rules: Vec::new(),
            }),
        }
    }

    /// 规则配置变化时重新编译
    fn sync_rules(&self, configs: &[AffinityRuleConfig]) -> Arc<RuleSet> {
        let current = self.rules.load_full();
        if current.source == configs {
            return current;
        }
        let rules = configs
            .iter()
            .filter_map(|config| match AffinityRule::compile(config) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    lwarn!(
                        "system",
                        LogStage::Configuration,
                        LogComponent::Affinity,
                        "rule_invalid",
                        "忽略无效的亲和规则",
                        rule = %config.name,
                        error = %e
                    );
                    None
                }
            })
            .collect();
        let next = Arc::new(RuleSet {
            source: configs.to_vec(),
            rules,
        });
        self.rules.store(Arc::clone(&next));
        next
    }

    /// 按第一条匹配且能提取到值的规则生成亲和键
    pub fn resolve_key(&self, configs: &[AffinityRuleConfig], ctx: &AffinityContext<'_>) -> Option<AffinityKey> {
        if configs.is_empty() {
            return None;
        }
        let rule_set = self.sync_rules(configs);
        rule_set
            .rules
            .iter()
            .filter(|rule| rule.matches(ctx.model, ctx.path))
            .find_map(|rule| {
                let value = extract_value(&rule.source, ctx)?;
                let key = if rule.include_using_group {
                    format!("{}:{}:{value}", rule.name, ctx.using_group)
                } else {
                    format!("{}:{value}", rule.name)
                };
                Some(AffinityKey { key, ttl: rule.ttl })
            })
    }

    pub async fn lookup(&self, key: &AffinityKey) -> Option<ChannelId> {
        self.cache.get(&key.key).await.map(|b| b.channel_id)
    }

    /// 成功派发后绑定渠道
    pub async fn bind(&self, request_id: &str, key: &AffinityKey, channel_id: ChannelId) {
        self.cache
            .insert(
                key.key.clone(),
                Binding {
                    channel_id,
                    ttl: key.ttl,
                },
            )
            .await;
        ldebug!(
            request_id,
            LogStage::Cache,
            LogComponent::Affinity,
            "bound",
            "已记录亲和渠道",
            key = %key.key,
            channel_id = channel_id
        );
    }

    pub async fn invalidate(&self, key: &AffinityKey) {
        self.cache.invalidate(&key.key).await;
    }
}

fn extract_value(source: &AffinityKeySource, ctx: &AffinityContext<'_>) -> Option<String> {
    let value = match source {
        AffinityKeySource::ContextInt(field) => match field.as_str() {
            "user_id" => Some(ctx.user_id.to_string()),
            "token_id" => Some(ctx.token_id.to_string()),
            _ => None,
        },
        AffinityKeySource::ContextString(field) => match field.as_str() {
            "client_ip" => Some(ctx.client_ip.to_string()),
            "user_group" => Some(ctx.user_group.to_string()),
            "using_group" => Some(ctx.using_group.to_string()),
            "model" | "origin_model" => Some(ctx.model.to_string()),
            _ => None,
        },
        AffinityKeySource::JsonPath(path) => ctx.body.and_then(|body| json_path(body, path)).and_then(scalar),
    };
    value.filter(|v| !v.is_empty())
}

/// 解析 `a.b[0].c` 形式的路径
#[must_use]
pub fn json_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (name, indices) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !name.is_empty() {
            current = current.get(name)?;
        }
        for raw in indices.split('[').filter(|s| !s.is_empty()) {
            let index: i64 = raw.strip_suffix(']')?.parse().ok()?;
            let array = current.as_array()?;
            let resolved = if index < 0 {
                array.len().checked_sub(index.unsigned_abs() as usize)?
            } else {
                index as usize
            };
            current = array.get(resolved)?;
        }
    }
    Some(current)
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}
