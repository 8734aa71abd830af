//! # 渠道选择
//!
//! 亲和命中优先；否则按优先级降序、同优先级内按权重随机，
//! 跳过已尝试、限额已满或日预算耗尽的渠道。

use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::model::Channel;
use super::registry::ChannelRegistry;
use crate::error::{RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::ratelimit::{BudgetScope, RateLimiter};
use crate::types::{ChannelId, TokenId};
use crate::{ldebug, linfo};

/// 选择请求
#[derive(Debug, Clone)]
pub struct SelectionRequest<'a> {
    pub request_id: &'a str,
    pub group: &'a str,
    pub model: &'a str,
    pub retry_count: u32,
    /// 本次请求已尝试过的渠道
    pub tried: &'a HashSet<ChannelId>,
    pub token_id: TokenId,
    pub client_ip: &'a str,
    /// 亲和缓存给出的渠道
    pub affinity: Option<ChannelId>,
}

/// 选择结果
#[derive(Debug, Clone)]
pub struct Selection {
    pub channel: Arc<Channel>,
    pub key_index: usize,
    pub from_affinity: bool,
}

/// 渠道选择器
pub struct ChannelSelector {
    registry: Arc<ChannelRegistry>,
    limiter: RateLimiter,
    /// 多密钥渠道的轮询游标
    cursors: DashMap<ChannelId, Arc<AtomicUsize>>,
}

impl ChannelSelector {
    #[must_use]
    pub fn new(registry: Arc<ChannelRegistry>, limiter: RateLimiter) -> Self {
        Self {
            registry,
            limiter,
            cursors: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// 选出一个渠道及其密钥
    pub async fn select(&self, request: &SelectionRequest<'_>) -> Result<Selection> {
        let snapshot = self.registry.snapshot();

        if let Some(channel) = request
            .affinity
            .and_then(|id| snapshot.channel(id))
            .filter(|c| {
                c.is_selectable() && c.supports_model(request.model) && !request.tried.contains(&c.id)
            })
        {
            if let Some(key_index) = self.pick_key(channel, request.model).await {
                ldebug!(
                    request.request_id,
                    LogStage::Scheduling,
                    LogComponent::ChannelSelector,
                    "affinity_hit",
                    "命中亲和渠道",
                    channel_id = channel.id
                );
                return Ok(Selection {
                    channel: Arc::clone(channel),
                    key_index,
                    from_affinity: true,
                });
            }
        }

        // 优先级降序分层
        let mut levels: BTreeMap<std::cmp::Reverse<i64>, Vec<&Arc<Channel>>> = BTreeMap::new();
        for channel in snapshot
            .candidates(request.group, request.model)
            .iter()
            .filter(|id| !request.tried.contains(id))
            .filter_map(|id| snapshot.channel(*id))
        {
            levels
                .entry(std::cmp::Reverse(channel.priority))
                .or_default()
                .push(channel);
        }

        for (_, level) in levels {
            for channel in weighted_order(level) {
                if !self.budget_available(channel, request).await {
                    continue;
                }
                if let Some(key_index) = self.pick_key(channel, request.model).await {
                    linfo!(
                        request.request_id,
                        LogStage::Scheduling,
                        LogComponent::ChannelSelector,
                        "selected",
                        "已选择渠道",
                        channel_id = channel.id,
                        key_index = key_index,
                        priority = channel.priority,
                        retry = request.retry_count
                    );
                    return Ok(Selection {
                        channel: Arc::clone(channel),
                        key_index,
                        from_affinity: false,
                    });
                }
            }
        }

        Err(RelayError::no_available_channel(request.group, request.model))
    }

    /// 在启用且未超出模型限额的密钥中轮询
    async fn pick_key(&self, channel: &Channel, model: &str) -> Option<usize> {
        let enabled: Vec<usize> = channel.enabled_key_indices().collect();
        if enabled.is_empty() {
            return None;
        }
        let caps = channel.caps_for(model);
        let start = if enabled.len() > 1 {
            let cursor = self
                .cursors
                .entry(channel.id)
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                .clone();
            cursor.fetch_add(1, Ordering::Relaxed)
        } else {
            0
        };

        for offset in 0..enabled.len() {
            let key_index = enabled[(start + offset) % enabled.len()];
            if self
                .limiter
                .peek_channel_caps(channel.id, key_index, model, &caps)
                .await
            {
                return Some(key_index);
            }
        }
        None
    }

    async fn budget_available(&self, channel: &Channel, request: &SelectionRequest<'_>) -> bool {
        let Some(budget) = channel.daily_request_budget.filter(|b| *b > 0) else {
            return true;
        };
        if request.token_id > 0
            && !self
                .limiter
                .peek_daily_budget(channel.id, &BudgetScope::Token(request.token_id), budget)
                .await
        {
            return false;
        }
        request.client_ip.is_empty()
            || self
                .limiter
                .peek_daily_budget(channel.id, &BudgetScope::ClientIp(request.client_ip), budget)
                .await
    }
}

/// 按权重随机排序，权重 0 视为 1
///
/// 每个元素取 `u^(1/w)` 作为排序键，排在最前的元素被选中的概率与权重成正比。
fn weighted_order(mut channels: Vec<&Arc<Channel>>) -> Vec<&Arc<Channel>> {
    if channels.len() <= 1 {
        return channels;
    }
    let mut keyed: Vec<(f64, &Arc<Channel>)> = channels
        .drain(..)
        .map(|c| {
            let weight = f64::from(c.weight.max(1));
            (fastrand::f64().powf(1.0 / weight), c)
        })
        .collect();
    keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
    keyed.into_iter().map(|(_, c)| c).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::model::ModelCaps;
    use crate::config::RateLimitConfig;
    use crate::store::MemoryStore;
    use crate::types::ProviderKind;
    use std::collections::HashMap;

    fn channel(id: ChannelId, priority: i64, weight: u32) -> Channel {
        let mut c = Channel::new(id, ProviderKind::OpenAi, "https://api.example.com", format!("sk-{id}"));
        c.models = vec!["gpt-4o".to_string()];
        c.priority = priority;
        c.weight = weight;
        c
    }

    async fn selector(channels: Vec<Channel>) -> ChannelSelector {
        let store = MemoryStore::new();
        for c in channels {
            store.insert_channel(c);
        }
        let registry = ChannelRegistry::load(store).await.unwrap();
        ChannelSelector::new(registry, RateLimiter::memory(RateLimitConfig::default()))
    }

    fn request<'a>(tried: &'a HashSet<ChannelId>) -> SelectionRequest<'a> {
        SelectionRequest {
            request_id: "req",
            group: "default",
            model: "gpt-4o",
            retry_count: 0,
            tried,
            token_id: 1,
            client_ip: "127.0.0.1",
            affinity: None,
        }
    }

    #[tokio::test]
    async fn test_highest_priority_wins_and_tried_excluded() {
        let selector = selector(vec![channel(10, 10, 1), channel(11, 5, 1), channel(12, 1, 1)]).await;
        let mut tried = HashSet::new();
        assert_eq!(selector.select(&request(&tried)).await.unwrap().channel.id, 10);

        tried.insert(10);
        assert_eq!(selector.select(&request(&tried)).await.unwrap().channel.id, 11);

        tried.extend([11, 12]);
        let err = selector.select(&request(&tried)).await.unwrap_err();
        assert!(matches!(err, RelayError::NoAvailableChannel { .. }));
    }

    #[tokio::test]
    async fn test_weighted_random_distribution() {
        let selector = selector(vec![channel(1, 0, 9), channel(2, 0, 1)]).await;
        let tried = HashSet::new();
        let mut hits: HashMap<ChannelId, u32> = HashMap::new();
        for _ in 0..2_000 {
            let id = selector.select(&request(&tried)).await.unwrap().channel.id;
            *hits.entry(id).or_default() += 1;
        }
        let heavy = hits.get(&1).copied().unwrap_or_default();
        assert!(heavy > 1_500 && heavy < 1_950, "heavy channel picked {heavy} times");
    }

    #[tokio::test]
    async fn test_affinity_respected_unless_tried() {
        let selector = selector(vec![channel(1, 10, 1), channel(2, 0, 1)]).await;
        let mut tried = HashSet::new();
        let mut req = request(&tried);
        req.affinity = Some(2);
        let selection = selector.select(&req).await.unwrap();
        assert_eq!(selection.channel.id, 2);
        assert!(selection.from_affinity);

        tried.insert(2);
        let mut req = request(&tried);
        req.affinity = Some(2);
        assert_eq!(selector.select(&req).await.unwrap().channel.id, 1);
    }

    #[tokio::test]
    async fn test_round_robin_over_keys_and_caps() {
        let mut c = channel(3, 0, 1);
        c.keys.push(crate::channel::KeyState::new("sk-3b"));
        c.model_caps.insert(
            "gpt-4o".to_string(),
            ModelCaps {
                rpm: 1,
                tpm: 0,
                rpd: 0,
            },
        );
        let selector = selector(vec![c]).await;
        let tried = HashSet::new();

        let first = selector.select(&request(&tried)).await.unwrap();
        let second = selector.select(&request(&tried)).await.unwrap();
        assert_ne!(first.key_index, second.key_index);

        // 两个密钥都用掉 rpm 后渠道不再可选
        let caps = first.channel.caps_for("gpt-4o");
        selector.limiter.record_channel_request(3, 0, "gpt-4o", &caps).await;
        selector.limiter.record_channel_request(3, 1, "gpt-4o", &caps).await;
        assert!(selector.select(&request(&tried)).await.is_err());
    }

    #[tokio::test]
    async fn test_daily_budget_excludes_channel() {
        let mut limited = channel(20, 10, 1);
        limited.daily_request_budget = Some(1);
        let selector = selector(vec![limited, channel(21, 0, 1)]).await;
        let tried = HashSet::new();

        assert_eq!(selector.select(&request(&tried)).await.unwrap().channel.id, 20);
        selector
            .limiter
            .record_daily_budget(20, &BudgetScope::Token(1))
            .await;
        assert_eq!(selector.select(&request(&tried)).await.unwrap().channel.id, 21);
    }
}
