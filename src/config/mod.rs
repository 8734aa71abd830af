//! # 配置管理模块
//!
//! 处理应用配置加载、环境变量覆盖、验证和运行时选项

mod app_config;
mod database;
pub mod options;
mod watcher;

pub use app_config::{
    AppConfig, BillingConfig, CacheConfig, CacheType, ChannelConfig, KeepAliveConfig,
    LoggingConfig, RateLimitConfig, RecentCallsConfig, RedisConfig, RelayConfig, ServerConfig,
    TaskConfig, TrafficConfig, UserLimits,
};
pub use database::{DatabaseConfig, StoreBackend};
pub use options::{AffinityKeySource, AffinityRuleConfig, OptionStore, RuntimeOptions};
pub use watcher::{ConfigEvent, OptionWatcher};

use crate::error::{RelayError, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// 默认配置文件路径：`config/config.{RUST_ENV}.toml`
#[must_use]
pub fn default_config_path() -> PathBuf {
    let env = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
    PathBuf::from(format!("config/config.{env}.toml"))
}

/// 加载配置文件并应用环境变量覆盖
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let config_file = path.map_or_else(default_config_path, Path::to_path_buf);

    let mut config = if config_file.exists() {
        load_config_from_file(&config_file)?
    } else if path.is_some() {
        return Err(RelayError::config(format!(
            "配置文件不存在: {}",
            config_file.display()
        )));
    } else {
        AppConfig::default()
    };

    apply_env_overrides(&mut config, |key| env::var(key).ok())?;
    validate_config(&config)?;

    Ok(config)
}

/// 读取并解析配置文件（不含环境变量覆盖）
pub fn load_config_from_file(path: &Path) -> Result<AppConfig> {
    let config_content = std::fs::read_to_string(path).map_err(|e| {
        RelayError::config_with_source(format!("读取配置文件失败: {}", path.display()), e)
    })?;

    let config: AppConfig = toml::from_str(&config_content)?;
    Ok(config)
}

/// 验证配置有效性
pub fn validate_config(config: &AppConfig) -> Result<()> {
    config.validate().map_err(RelayError::config)
}

fn parse_env<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| RelayError::config(format!("环境变量 {key} 的值无效: {raw}")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RelayError::config(format!("环境变量 {key} 的值无效: {raw}"))),
    }
}

/// 应用环境变量覆盖
///
/// `lookup` 便于测试时注入环境变量。
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup("RELAY_TIMEOUT") {
        config.relay.timeout_secs = parse_env("RELAY_TIMEOUT", &raw)?;
    }
    if let Some(raw) = lookup("CHANNEL_TEST_FREQUENCY") {
        config.channel.test_frequency_secs = parse_env("CHANNEL_TEST_FREQUENCY", &raw)?;
    }
    if let Some(raw) = lookup("CHANNEL_UPDATE_FREQUENCY") {
        config.channel.update_frequency_secs = parse_env("CHANNEL_UPDATE_FREQUENCY", &raw)?;
    }
    if let Some(raw) = lookup("TRAFFIC_MONITOR_ENABLED") {
        config.traffic.monitor_enabled = parse_bool("TRAFFIC_MONITOR_ENABLED", &raw)?;
    }
    if let Some(raw) = lookup("TRAFFIC_GRACEFUL_TIMEOUT") {
        config.traffic.graceful_timeout_secs = parse_env("TRAFFIC_GRACEFUL_TIMEOUT", &raw)?;
    }
    if let Some(raw) = lookup("REQUEST_PERSISTENCE_ENABLED") {
        config.recent_calls.persist_bodies = parse_bool("REQUEST_PERSISTENCE_ENABLED", &raw)?;
    }
    if let Some(raw) = lookup("LOG_SAMPLE_RATIO") {
        config.logging.sample_ratio = parse_env("LOG_SAMPLE_RATIO", &raw)?;
    }
    for provider in ["openai", "anthropic", "gemini"] {
        let key = format!("{}_HEADER_KEY", provider.to_ascii_uppercase());
        if let Some(header) = lookup(&key) {
            config
                .relay
                .header_key_overrides
                .insert(provider.to_string(), header.trim().to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RELAY_TIMEOUT", "45"),
            ("TRAFFIC_MONITOR_ENABLED", "true"),
            ("LOG_SAMPLE_RATIO", "0.25"),
            ("ANTHROPIC_HEADER_KEY", "x-custom-key"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(|v| (*v).to_string())).unwrap();

        assert_eq!(config.relay.timeout_secs, 45);
        assert!(config.traffic.monitor_enabled);
        assert!((config.logging.sample_ratio - 0.25).abs() < f64::EPSILON);
        assert_eq!(
            config.relay.header_key_overrides.get("anthropic").map(String::as_str),
            Some("x-custom-key")
        );
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = AppConfig::default();
        let err = apply_env_overrides(&mut config, |k| {
            (k == "RELAY_TIMEOUT").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, RelayError::Config { .. }));
    }

    #[test]
    fn test_parse_toml_sections() {
        let raw = r#"
            [server]
            port = 8088

            [cache]
            cache_type = "redis"
            [cache.redis]
            url = "redis://10.0.0.2:6379/1"

            [options]
            retry_times = 2
            [options.model_ratio]
            "gpt-4o" = 1.25
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.cache.cache_type, CacheType::Redis);
        assert_eq!(config.options.retry_times, 2);
        assert_eq!(config.options.model_ratio("gpt-4o"), Some(1.25));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_dev_config_file_is_valid() {
        let config = load_config_from_file(Path::new("config/config.dev.toml")).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.rate_limit.default_limits.rpm, 600);
        assert_eq!(config.options.model_ratio("claude-sonnet-4"), Some(1.5));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_missing_explicit_config_file() {
        let err = load_config(Some(Path::new("config/does-not-exist.toml"))).unwrap_err();
        assert!(matches!(err, RelayError::Config { .. }));
    }
}
