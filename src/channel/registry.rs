//! # 渠道注册表
//!
//! 读者通过原子指针获取不可变快照；所有状态变更由持有异步互斥锁的单一写者完成，
//! 先持久化再发布新快照。

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::model::{Channel, DisableOutcome};
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::store::ChannelRepository;
use crate::types::{ChannelId, now_timestamp};
use crate::{ldebug, linfo, lwarn};

/// 注册表快照
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    channels: HashMap<ChannelId, Arc<Channel>>,
    /// `(分组, 模型) → 渠道 id`，只包含可选中的渠道
    index: HashMap<(String, String), Vec<ChannelId>>,
    version: u64,
}

impl RegistrySnapshot {
    /// 根据渠道列表构建快照
    #[must_use]
    pub fn build(channels: impl IntoIterator<Item = Arc<Channel>>, version: u64) -> Self {
        let channels: HashMap<ChannelId, Arc<Channel>> =
            channels.into_iter().map(|c| (c.id, c)).collect();

        let mut index: HashMap<(String, String), Vec<ChannelId>> = HashMap::new();
        for channel in channels.values().filter(|c| c.is_selectable()) {
            for group in &channel.groups {
                for model in &channel.models {
                    index
                        .entry((group.clone(), model.clone()))
                        .or_default()
                        .push(channel.id);
                }
            }
        }
        for ids in index.values_mut() {
            ids.sort_unstable();
        }

        Self {
            channels,
            index,
            version,
        }
    }

    #[must_use]
    pub fn channel(&self, id: ChannelId) -> Option<&Arc<Channel>> {
        self.channels.get(&id)
    }

    /// 某分组下可服务该模型的渠道 id
    #[must_use]
    pub fn candidates(&self, group: &str, model: &str) -> &[ChannelId] {
        self.index
            .get(&(group.to_string(), model.to_string()))
            .map_or(&[], Vec::as_slice)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }
}

/// 渠道注册表
pub struct ChannelRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
    writer: Mutex<()>,
    repository: Arc<dyn ChannelRepository>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new(repository: Arc<dyn ChannelRepository>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            writer: Mutex::new(()),
            repository,
        }
    }

    /// 创建并立即加载全部渠道
    pub async fn load(repository: Arc<dyn ChannelRepository>) -> Result<Arc<Self>> {
        let registry = Arc::new(Self::new(repository));
        registry.refresh().await?;
        Ok(registry)
    }

    /// 当前快照
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    fn publish(&self, channels: impl IntoIterator<Item = Arc<Channel>>) {
        let version = self.snapshot.load().version + 1;
        self.snapshot
            .store(Arc::new(RegistrySnapshot::build(channels, version)));
    }

    /// 替换单个渠道后重新发布
    fn publish_with(&self, updated: Channel) {
        let current = self.snapshot.load_full();
        let updated = Arc::new(updated);
        let updated_id = updated.id;
        let channels = current
            .channels()
            .filter(move |c| c.id != updated_id)
            .cloned()
            .chain(std::iter::once(updated));
        self.publish(channels);
    }

    /// 从仓储重新加载全部渠道
    pub async fn refresh(&self) -> Result<usize> {
        let _guard = self.writer.lock().await;
        let channels = self.repository.load_channels().await?;
        let count = channels.len();
        self.publish(channels.into_iter().map(Arc::new));
        ldebug!(
            "system",
            LogStage::BackgroundTask,
            LogComponent::ChannelRegistry,
            "refreshed",
            "渠道缓存已刷新",
            channels = count
        );
        Ok(count)
    }

    async fn persist(&self, channel: &Channel) {
        if let Err(e) = self.repository.save_channel_state(channel).await {
            lwarn!(
                "system",
                LogStage::Db,
                LogComponent::ChannelRegistry,
                "persist_failed",
                "渠道状态持久化失败，仅在内存中生效",
                channel_id = channel.id,
                error = %e
            );
        }
    }

    /// 自动禁用密钥或渠道
    pub async fn auto_disable(
        &self,
        request_id: &str,
        channel_id: ChannelId,
        key_index: usize,
        reason: &str,
    ) -> DisableOutcome {
        let _guard = self.writer.lock().await;
        let Some(current) = self.snapshot.load().channel(channel_id).cloned() else {
            return DisableOutcome::Unchanged;
        };

        let mut channel = (*current).clone();
        let outcome = channel.apply_auto_disable(key_index, reason, now_timestamp());
        if outcome == DisableOutcome::Unchanged {
            return outcome;
        }

        self.persist(&channel).await;
        lwarn!(
            request_id,
            LogStage::ResponseFailure,
            LogComponent::ChannelRegistry,
            "auto_disabled",
            "渠道或密钥已被自动禁用",
            channel_id = channel_id,
            key_index = key_index,
            outcome = ?outcome,
            reason = %reason
        );
        self.publish_with(channel);
        outcome
    }

    /// 恢复非余额耗尽原因的自动禁用，返回恢复的渠道数
    pub async fn reenable_sweep(&self) -> usize {
        let _guard = self.writer.lock().await;
        let current = self.snapshot.load_full();

        let mut restored = Vec::new();
        for channel in current.channels() {
            let mut candidate = (**channel).clone();
            if candidate.reenable_auto_disabled() {
                self.persist(&candidate).await;
                restored.push(candidate);
            }
        }

        let count = restored.len();
        if count > 0 {
            let restored: HashMap<ChannelId, Arc<Channel>> = restored
                .into_iter()
                .map(|c| (c.id, Arc::new(c)))
                .collect();
            let channels = current
                .channels()
                .map(|c| restored.get(&c.id).cloned().unwrap_or_else(|| Arc::clone(c)))
                .collect::<Vec<_>>();
            self.publish(channels);
            linfo!(
                "system",
                LogStage::BackgroundTask,
                LogComponent::ChannelRegistry,
                "reenabled",
                "自动禁用的渠道已恢复",
                channels = count
            );
        }
        count
    }

    /// 直接发布一组渠道（测试与启动时使用）
    pub async fn replace_all(&self, channels: Vec<Channel>) {
        let _guard = self.writer.lock().await;
        self.publish(channels.into_iter().map(Arc::new));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::model::{ChannelStatus, KeyState};
    use crate::store::MemoryStore;
    use crate::types::ProviderKind;

    fn channel(id: ChannelId, models: &[&str]) -> Channel {
        let mut c = Channel::new(id, ProviderKind::OpenAi, "https://api.example.com", format!("sk-{id}"));
        c.models = models.iter().map(ToString::to_string).collect();
        c
    }

    #[tokio::test]
    async fn test_index_only_contains_selectable() {
        let store = MemoryStore::new();
        let mut disabled = channel(2, &["gpt-4o"]);
        disabled.status = ChannelStatus::ManuallyDisabled;
        store.insert_channel(channel(1, &["gpt-4o", "gpt-4o-mini"]));
        store.insert_channel(disabled);

        let registry = ChannelRegistry::load(store).await.unwrap();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.candidates("default", "gpt-4o"), &[1]);
        assert!(snapshot.candidates("vip", "gpt-4o").is_empty());
    }

    #[tokio::test]
    async fn test_auto_disable_persists_and_republishes() {
        let store = MemoryStore::new();
        store.insert_channel(channel(13, &["gpt-4o"]));
        let registry = ChannelRegistry::load(store.clone()).await.unwrap();
        let before = registry.snapshot();

        let outcome = registry
            .auto_disable("req-1", 13, 0, "status 401: invalid key")
            .await;
        assert_eq!(outcome, DisableOutcome::ChannelDisabled);

        let after = registry.snapshot();
        assert!(after.version() > before.version());
        assert!(after.candidates("default", "gpt-4o").is_empty());
        // 旧快照不受影响
        assert_eq!(before.candidates("default", "gpt-4o"), &[13]);

        let persisted = store.channel(13).unwrap();
        assert_eq!(persisted.status, ChannelStatus::AutoDisabled);
        assert!(persisted.disabled_reason.unwrap().contains("401"));
    }

    #[tokio::test]
    async fn test_reenable_sweep() {
        let store = MemoryStore::new();
        let mut c = channel(5, &["gpt-4o"]);
        c.keys.push(KeyState::new("sk-5b"));
        store.insert_channel(c);
        let registry = ChannelRegistry::load(store).await.unwrap();

        registry.auto_disable("r", 5, 0, "status 401: bad").await;
        registry
            .auto_disable("r", 5, 1, "insufficient_quota: status 429: quota")
            .await;
        assert!(registry.snapshot().candidates("default", "gpt-4o").is_empty());

        assert_eq!(registry.reenable_sweep().await, 1);
        let snapshot = registry.snapshot();
        let restored = snapshot.channel(5).unwrap();
        assert!(restored.status.is_enabled());
        assert!(restored.keys[0].status.is_enabled());
        assert!(!restored.keys[1].status.is_enabled());
        assert_eq!(snapshot.candidates("default", "gpt-4o"), &[5]);
    }
}
