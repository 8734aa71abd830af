//! # Anthropic 适配器

pub mod convert;
pub mod stream;
pub mod types;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue};

use self::convert::{apply_thinking, openai_to_claude_request};
use self::types::MessagesRequest;
use super::endpoint::{ChannelEndpoints, EndpointKey};
use super::gemini::convert::gemini_to_openai_request;
use super::gemini::types::GenerateContentRequest;
use super::image::ImageFetcher;
use super::openai::types::ChatRequest;
use super::role_map::apply_role_mapping;
use super::{Adaptor, RequestBody, apply_header_overrides, common_headers, insert_secret};
use crate::error::Result;
use crate::relay::RelayInfo;
use crate::types::{ProviderKind, RelayFormat};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
const MESSAGES_PATH: &str = "/v1/messages";
const DEFAULT_KEY_HEADER: &str = "x-api-key";

/// 客户端可透传的 Anthropic 专有头
const PASSTHROUGH_HEADERS: &[&str] = &["anthropic-version", "anthropic-beta"];

pub struct ClaudeAdaptor {
    images: ImageFetcher,
    key_header: String,
}

impl ClaudeAdaptor {
    #[must_use]
    pub fn new(images: ImageFetcher, key_header: Option<String>) -> Self {
        Self {
            images,
            key_header: key_header.unwrap_or_else(|| DEFAULT_KEY_HEADER.to_string()),
        }
    }

    fn finish_request(info: &RelayInfo, mut request: MessagesRequest) -> Result<RequestBody> {
        request.model.clone_from(&info.upstream_model);
        request.stream = info.is_stream.then_some(true);
        apply_thinking(
            &mut request,
            info.thinking,
            info.reasoning_effort.as_deref(),
            info.options.thinking_budget_percentage,
        );
        RequestBody::json(&request)
    }
}

#[async_trait]
impl Adaptor for ClaudeAdaptor {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn request_url(&self, info: &RelayInfo) -> Result<String> {
        ChannelEndpoints::parse(&info.base_url)?.resolve(
            EndpointKey::classify(info.mode, RelayFormat::Claude),
            &info.upstream_model,
            MESSAGES_PATH,
            "",
        )
    }

    fn auth_headers(&self, info: &RelayInfo, target: &mut HeaderMap) -> Result<()> {
        insert_secret(target, &self.key_header, &info.api_key)?;
        if !target.contains_key("anthropic-version") {
            target.insert(
                HeaderName::from_static("anthropic-version"),
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
        }
        Ok(())
    }

    fn setup_headers(&self, client: &HeaderMap, target: &mut HeaderMap, info: &RelayInfo) -> Result<()> {
        common_headers(client, target, info);
        if info.format == RelayFormat::Claude {
            for name in PASSTHROUGH_HEADERS {
                if let Some(value) = client.get(*name) {
                    target.insert(HeaderName::from_static(*name), value.clone());
                }
            }
        }
        self.auth_headers(info, target)?;
        apply_header_overrides(target, &info.header_overrides, &info.api_key);
        Ok(())
    }

    async fn convert_openai_request(&self, info: &mut RelayInfo, mut request: ChatRequest) -> Result<RequestBody> {
        apply_role_mapping(&info.options.role_mapping, &info.upstream_model, &mut request.messages);
        if info.reasoning_effort.is_none() {
            info.reasoning_effort.clone_from(&request.reasoning_effort);
        }
        let converted = openai_to_claude_request(request, &self.images).await?;
        Self::finish_request(info, converted)
    }

    async fn convert_claude_request(&self, info: &mut RelayInfo, request: MessagesRequest) -> Result<RequestBody> {
        // 客户端自带 thinking 配置时只有模型后缀能覆盖
        if request.thinking.is_some() && !info.thinking {
            info.reasoning_effort = None;
        }
        Self::finish_request(info, request)
    }

    async fn convert_gemini_request(
        &self,
        info: &mut RelayInfo,
        request: GenerateContentRequest,
    ) -> Result<RequestBody> {
        let chat = gemini_to_openai_request(request, &info.upstream_model);
        if info.reasoning_effort.is_none() {
            info.reasoning_effort.clone_from(&chat.reasoning_effort);
        }
        let converted = openai_to_claude_request(chat, &self.images).await?;
        Self::finish_request(info, converted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::openai::types::ChatMessage;
    use crate::config::RuntimeOptions;
    use crate::types::RelayMode;
    use reqwest::Client;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    fn adaptor() -> ClaudeAdaptor {
        ClaudeAdaptor::new(ImageFetcher::new(Client::new(), 1024, Duration::from_secs(1)), None)
    }

    fn info(model: &str) -> RelayInfo {
        let mut info = RelayInfo::new(
            "req-1",
            RelayFormat::OpenAi,
            RelayMode::Chat,
            model,
            Arc::new(RuntimeOptions::default()),
        );
        info.base_url = "https://api.anthropic.com".into();
        info.api_key = "sk-ant".into();
        info.provider = ProviderKind::Anthropic;
        info
    }

    #[test]
    fn test_url_and_headers() {
        let adaptor = adaptor();
        let info = info("claude-sonnet-4");
        assert_eq!(adaptor.request_url(&info).unwrap(), "https://api.anthropic.com/v1/messages");

        let mut headers = HeaderMap::new();
        adaptor.setup_headers(&HeaderMap::new(), &mut headers, &info).unwrap();
        assert_eq!(headers["x-api-key"], "sk-ant");
        assert_eq!(headers["anthropic-version"], ANTHROPIC_VERSION);
    }

    #[test]
    fn test_custom_key_header() {
        let adaptor = ClaudeAdaptor::new(
            ImageFetcher::new(Client::new(), 1024, Duration::from_secs(1)),
            Some("api-key".into()),
        );
        let mut headers = HeaderMap::new();
        adaptor.auth_headers(&info("claude-sonnet-4"), &mut headers).unwrap();
        assert_eq!(headers["api-key"], "sk-ant");
        assert!(!headers.contains_key("x-api-key"));
    }

    #[tokio::test]
    async fn test_thinking_suffix_in_openai_request() {
        let adaptor = adaptor();
        let mut info = info("claude-sonnet-4-thinking");
        adaptor.init(&mut info);
        assert_eq!(info.upstream_model, "claude-sonnet-4");
        assert!(info.thinking);

        let request = ChatRequest {
            model: "claude-sonnet-4-thinking".into(),
            messages: vec![ChatMessage::text("user", "hi")],
            max_tokens: Some(4000),
            ..ChatRequest::default()
        };
        let body = adaptor.convert_openai_request(&mut info, request).await.unwrap();
        let value = body.as_value().unwrap();
        assert_eq!(value["model"], "claude-sonnet-4");
        assert_eq!(value["thinking"]["type"], "enabled");
        let budget = value["thinking"]["budget_tokens"].as_u64().unwrap();
        let expected = (4000.0 * RuntimeOptions::default().thinking_budget_percentage).floor() as u64;
        assert_eq!(budget, expected);
        assert_eq!(value["temperature"], 1.0);
        assert_eq!(value.get("top_p"), None::<&Value>);
    }
}
