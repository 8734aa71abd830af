//! # 多端点渠道
//!
//! 渠道 base URL 可以是单个 URL，也可以是 `{端点键 → URL 模板}` 的 JSON 映射。
//! 模板支持 `{model}`、`{path}`、`{query}` 三个占位符，按字面替换。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;
use crate::types::{RelayFormat, RelayMode};
use crate::{config_error, ensure_config};

/// 端点键
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKey {
    Openai,
    OpenaiResponses,
    Embedding,
    OpenaiImage,
    OpenaiAudio,
    OpenaiRealtime,
    Rerank,
    Claude,
    Gemini,
    Default,
}

impl EndpointKey {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::OpenaiResponses => "openai_responses",
            Self::Embedding => "embedding",
            Self::OpenaiImage => "openai_image",
            Self::OpenaiAudio => "openai_audio",
            Self::OpenaiRealtime => "openai_realtime",
            Self::Rerank => "rerank",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Default => "default",
        }
    }

    /// 按请求模式与上游协议归类
    #[must_use]
    pub const fn classify(mode: RelayMode, upstream: RelayFormat) -> Self {
        match (mode, upstream) {
            (RelayMode::Chat | RelayMode::Completion, RelayFormat::Claude) => Self::Claude,
            (RelayMode::Chat | RelayMode::Completion | RelayMode::Embedding, RelayFormat::Gemini) => {
                Self::Gemini
            }
            (RelayMode::Responses, _) => Self::OpenaiResponses,
            (RelayMode::Embedding, _) => Self::Embedding,
            (RelayMode::ImageGenerate | RelayMode::ImageEdit, _) => Self::OpenaiImage,
            (
                RelayMode::AudioSpeech | RelayMode::AudioTranscription | RelayMode::AudioTranslation,
                _,
            ) => Self::OpenaiAudio,
            (RelayMode::Realtime, _) => Self::OpenaiRealtime,
            (RelayMode::Rerank, _) => Self::Rerank,
            _ => Self::Openai,
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 解析后的渠道地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEndpoints {
    Single(String),
    Multi(BTreeMap<EndpointKey, String>),
}

impl ChannelEndpoints {
    /// 以 `{` 开头的 base URL 按多端点映射解析
    pub fn parse(base_url: &str) -> Result<Self> {
        let trimmed = base_url.trim();
        if !trimmed.starts_with('{') {
            return Ok(Self::Single(trimmed.trim_end_matches('/').to_string()));
        }
        let templates: BTreeMap<EndpointKey, String> = serde_json::from_str(trimmed)
            .map_err(|e| config_error!("多端点配置无效: {}", e))?;
        ensure_config!(!templates.is_empty(), "多端点配置为空");
        if let Some(realtime) = templates.get(&EndpointKey::OpenaiRealtime) {
            ensure_config!(
                realtime.starts_with("ws://") || realtime.starts_with("wss://"),
                "openai_realtime 端点必须是 ws/wss 地址: {}",
                realtime
            );
        }
        Ok(Self::Multi(templates))
    }

    /// 规范形式：单 URL 原样返回，映射按键排序序列化
    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            Self::Single(url) => url.clone(),
            Self::Multi(templates) => serde_json::to_string(templates).unwrap_or_default(),
        }
    }

    /// 计算完整上游地址
    ///
    /// 单 URL 渠道直接拼接 `path` 与 `query`；多端点渠道按 `key → default → openai` 回退选模板。
    pub fn resolve(&self, key: EndpointKey, model: &str, path: &str, query: &str) -> Result<String> {
        let query = query.trim_start_matches('?');
        match self {
            Self::Single(base) => {
                let base = if key == EndpointKey::OpenaiRealtime {
                    to_websocket(base)
                } else {
                    base.clone()
                };
                Ok(if query.is_empty() {
                    format!("{base}{path}")
                } else {
                    format!("{base}{path}?{query}")
                })
            }
            Self::Multi(templates) => {
                let template = templates
                    .get(&key)
                    .or_else(|| templates.get(&EndpointKey::Default))
                    .or_else(|| templates.get(&EndpointKey::Openai))
                    .ok_or_else(|| config_error!("多端点配置缺少 {} 端点", key))?;
                render(template, model, path, query)
            }
        }
    }
}

fn render(template: &str, model: &str, path: &str, query: &str) -> Result<String> {
    let mut url = template.replace("{model}", model).replace("{path}", path);
    if template.contains("{query}") {
        url = url.replace("{query}", query);
    } else if !query.is_empty() {
        ensure_config!(
            template.contains('?'),
            "端点模板不接受查询参数: {}",
            template
        );
        url.push('&');
        url.push_str(query);
    }
    Ok(url)
}

/// `http(s)://` → `ws(s)://`
#[must_use]
pub fn to_websocket(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_single_url() {
        let endpoints = ChannelEndpoints::parse("https://api.example.com/").unwrap();
        assert_eq!(
            endpoints
                .resolve(EndpointKey::Openai, "gpt-4o", "/v1/chat/completions", "")
                .unwrap(),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            endpoints
                .resolve(EndpointKey::OpenaiRealtime, "gpt-4o-realtime", "/v1/realtime", "model=x")
                .unwrap(),
            "wss://api.example.com/v1/realtime?model=x"
        );
    }

    #[test]
    fn test_template_fallback_and_substitution() {
        let endpoints = ChannelEndpoints::parse(
            r#"{"default": "https://gw.example.com{path}?{query}", "claude": "https://c.example.com/v1/messages", "embedding": "https://e.example.com/{model}/embed"}"#,
        )
        .unwrap();
        assert_eq!(
            endpoints
                .resolve(EndpointKey::Embedding, "bge-m3", "/v1/embeddings", "")
                .unwrap(),
            "https://e.example.com/bge-m3/embed"
        );
        assert_eq!(
            endpoints
                .resolve(EndpointKey::Rerank, "m", "/v1/rerank", "a=1")
                .unwrap(),
            "https://gw.example.com/v1/rerank?a=1"
        );
        let err = endpoints
            .resolve(EndpointKey::Claude, "m", "/v1/messages", "beta=true")
            .unwrap_err();
        assert!(matches!(err, RelayError::Config { .. }));
    }

    #[test]
    fn test_realtime_must_be_websocket() {
        let err = ChannelEndpoints::parse(r#"{"openai_realtime": "https://x/rt"}"#).unwrap_err();
        assert!(matches!(err, RelayError::Config { .. }));
        assert!(ChannelEndpoints::parse(r#"{"openai_realtime": "wss://x/rt"}"#).is_ok());
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(ChannelEndpoints::parse(r#"{"bogus": "https://x"}"#).is_err());
    }

    #[test]
    fn test_canonical_roundtrip() {
        let raw = r#"{"openai": "https://b{path}", "claude": "https://a/v1/messages"}"#;
        let parsed = ChannelEndpoints::parse(raw).unwrap();
        let canonical = parsed.canonical();
        assert_eq!(
            canonical,
            r#"{"openai":"https://b{path}","claude":"https://a/v1/messages"}"#
        );
        assert_eq!(ChannelEndpoints::parse(&canonical).unwrap(), parsed);
        assert_eq!(ChannelEndpoints::parse(&canonical).unwrap().canonical(), canonical);
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            EndpointKey::classify(RelayMode::Chat, RelayFormat::Claude),
            EndpointKey::Claude
        );
        assert_eq!(
            EndpointKey::classify(RelayMode::Embedding, RelayFormat::OpenAi),
            EndpointKey::Embedding
        );
        assert_eq!(
            EndpointKey::classify(RelayMode::AudioSpeech, RelayFormat::OpenAi),
            EndpointKey::OpenaiAudio
        );
    }
}
