//! # 配置文件监控模块
//!
//! 监听配置文件变化，重新解析 `[options]` 段并发布新的运行时选项快照

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::{OptionStore, RuntimeOptions, load_config_from_file};
use crate::error::{RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{linfo, lwarn};

/// 配置变更事件
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    /// 选项重载成功
    Reloaded(Arc<RuntimeOptions>),
    /// 重载失败，保留旧快照
    ReloadFailed(String),
    /// 配置文件被删除
    FileDeleted,
}

/// 运行时选项监控器
pub struct OptionWatcher {
    store: Arc<OptionStore>,
    config_path: PathBuf,
    event_sender: broadcast::Sender<ConfigEvent>,
    _watcher: RecommendedWatcher,
}

impl OptionWatcher {
    /// 创建监控器并开始监听配置文件所在目录
    pub fn new(config_path: impl AsRef<Path>, store: Arc<OptionStore>) -> Result<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let (event_sender, _) = broadcast::channel(64);

        let store_clone = Arc::clone(&store);
        let sender_clone = event_sender.clone();
        let path_clone = config_path.clone();

        let mut watcher = notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            match res {
                Ok(event) => Self::handle_file_event(&event, &store_clone, &sender_clone, &path_clone),
                Err(e) => {
                    lwarn!(
                        "system",
                        LogStage::Configuration,
                        LogComponent::Config,
                        "watch_error",
                        "文件监控错误",
                        error = %e
                    );
                }
            }
        })
        .map_err(|e| RelayError::config_with_source("创建文件监控器失败", e))?;

        let config_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        watcher
            .watch(config_dir, RecursiveMode::NonRecursive)
            .map_err(|e| RelayError::config_with_source("启动文件监控失败", e))?;

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Config,
            "option_watcher_started",
            "配置文件监控器已启动",
            path = %config_path.display()
        );

        Ok(Self {
            store,
            config_path,
            event_sender,
            _watcher: watcher,
        })
    }

    /// 订阅配置变更事件
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.event_sender.subscribe()
    }

    /// 手动重载
    pub fn reload(&self) -> Result<()> {
        reload_into(&self.config_path, &self.store, &self.event_sender)
    }

    fn handle_file_event(
        event: &Event,
        store: &Arc<OptionStore>,
        sender: &broadcast::Sender<ConfigEvent>,
        config_path: &Path,
    ) {
        let is_our_file = event
            .paths
            .iter()
            .any(|path| path.file_name() == config_path.file_name());
        if !is_our_file {
            return;
        }

        match &event.kind {
            EventKind::Modify(_) | EventKind::Create(_) => {
                // 等待编辑器写完文件
                std::thread::sleep(std::time::Duration::from_millis(100));
                if let Err(e) = reload_into(config_path, store, sender) {
                    lwarn!(
                        "system",
                        LogStage::Configuration,
                        LogComponent::Config,
                        "option_reload_failed",
                        "运行时选项重载失败，继续使用旧配置",
                        error = %e
                    );
                }
            }
            EventKind::Remove(_) => {
                lwarn!(
                    "system",
                    LogStage::Configuration,
                    LogComponent::Config,
                    "config_deleted",
                    "配置文件被删除",
                    path = %config_path.display()
                );
                let _ = sender.send(ConfigEvent::FileDeleted);
            }
            _ => {}
        }
    }
}

fn reload_into(
    path: &Path,
    store: &OptionStore,
    sender: &broadcast::Sender<ConfigEvent>,
) -> Result<()> {
    let parsed = load_config_from_file(path).and_then(|config| {
        config.options.validate().map_err(RelayError::config)?;
        Ok(config.options)
    });

    match parsed {
        Ok(options) => {
            store.publish(options);
            let _ = sender.send(ConfigEvent::Reloaded(store.snapshot()));
            linfo!(
                "system",
                LogStage::Configuration,
                LogComponent::Config,
                "options_reloaded",
                "运行时选项热重载成功"
            );
            Ok(())
        }
        Err(e) => {
            let _ = sender.send(ConfigEvent::ReloadFailed(e.to_string()));
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_reload_publishes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.test.toml");
        std::fs::write(&path, "[options]\nretry_times = 5\n").unwrap();

        let store = Arc::new(OptionStore::default());
        let (tx, mut rx) = broadcast::channel(4);
        reload_into(&path, &store, &tx).unwrap();

        assert_eq!(store.snapshot().retry_times, 5);
        assert!(matches!(rx.try_recv(), Ok(ConfigEvent::Reloaded(_))));
    }

    #[test]
    fn test_invalid_options_keep_old_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.test.toml");
        std::fs::write(&path, "[options]\nthinking_budget_percentage = 3.0\n").unwrap();

        let store = Arc::new(OptionStore::default());
        let (tx, _rx) = broadcast::channel(4);
        assert!(reload_into(&path, &store, &tx).is_err());
        assert!((store.snapshot().thinking_budget_percentage - 0.8).abs() < f64::EPSILON);
    }
}
