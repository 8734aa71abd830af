//! # Gemini 适配器

pub mod convert;
pub mod stream;
pub mod types;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;

use self::convert::{
    apply_thinking, gemini_embedding_to_openai, openai_to_gemini_embedding, openai_to_gemini_request,
};
use self::types::{BatchEmbedResponse, GenerateContentRequest};
use super::claude::convert::claude_to_openai_request;
use super::claude::types::MessagesRequest;
use super::endpoint::{ChannelEndpoints, EndpointKey};
use super::image::ImageFetcher;
use super::openai::types::{ChatRequest, EmbeddingRequest};
use super::role_map::apply_role_mapping;
use super::{Adaptor, RequestBody, insert_secret, read_body, stream as chat_stream};
use crate::error::Result;
use crate::relay::{RelayInfo, ResponseSink};
use crate::types::{ProviderKind, RelayFormat, RelayMode, Usage};

const API_VERSION: &str = "v1beta";
const DEFAULT_KEY_HEADER: &str = "x-goog-api-key";

pub struct GeminiAdaptor {
    images: ImageFetcher,
    key_header: String,
}

impl GeminiAdaptor {
    #[must_use]
    pub fn new(images: ImageFetcher, key_header: Option<String>) -> Self {
        Self {
            images,
            key_header: key_header.unwrap_or_else(|| DEFAULT_KEY_HEADER.to_string()),
        }
    }

    /// `models/{model}:{action}` 中的 action
    fn action(info: &RelayInfo) -> &str {
        if info.format == RelayFormat::Gemini {
            if let Some(action) = info.gemini_action.as_deref() {
                return action;
            }
        }
        match (info.mode, info.is_stream) {
            (RelayMode::Embedding, _) => "batchEmbedContents",
            (_, true) => "streamGenerateContent",
            (_, false) => "generateContent",
        }
    }

    fn finish_request(info: &RelayInfo, mut request: GenerateContentRequest) -> Result<RequestBody> {
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
impl Adaptor for GeminiAdaptor {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn request_url(&self, info: &RelayInfo) -> Result<String> {
        let action = Self::action(info);
        let path = format!("/{API_VERSION}/models/{}:{action}", info.upstream_model);
        let query = if action == "streamGenerateContent" { "alt=sse" } else { "" };
        ChannelEndpoints::parse(&info.base_url)?.resolve(
            EndpointKey::classify(info.mode, RelayFormat::Gemini),
            &info.upstream_model,
            &path,
            query,
        )
    }

    fn auth_headers(&self, info: &RelayInfo, target: &mut HeaderMap) -> Result<()> {
        insert_secret(target, &self.key_header, &info.api_key)
    }

    async fn convert_openai_request(&self, info: &mut RelayInfo, mut request: ChatRequest) -> Result<RequestBody> {
        apply_role_mapping(&info.options.role_mapping, &info.upstream_model, &mut request.messages);
        if info.reasoning_effort.is_none() {
            info.reasoning_effort.clone_from(&request.reasoning_effort);
        }
        let converted = openai_to_gemini_request(request, &self.images).await?;
        Self::finish_request(info, converted)
    }

    async fn convert_claude_request(&self, info: &mut RelayInfo, request: MessagesRequest) -> Result<RequestBody> {
        let chat = claude_to_openai_request(request);
        if info.reasoning_effort.is_none() {
            info.reasoning_effort.clone_from(&chat.reasoning_effort);
        }
        let converted = openai_to_gemini_request(chat, &self.images).await?;
        Self::finish_request(info, converted)
    }

    async fn convert_gemini_request(
        &self,
        info: &mut RelayInfo,
        request: GenerateContentRequest,
    ) -> Result<RequestBody> {
        Self::finish_request(info, request)
    }

    async fn convert_embedding_request(
        &self,
        info: &mut RelayInfo,
        request: EmbeddingRequest,
    ) -> Result<RequestBody> {
        RequestBody::json(&openai_to_gemini_embedding(&request, &info.upstream_model)?)
    }

    async fn do_response(
        &self,
        response: reqwest::Response,
        info: &mut RelayInfo,
        sink: &mut ResponseSink,
    ) -> Result<Usage> {
        if info.mode != RelayMode::Embedding {
            return chat_stream::relay_chat_response(response, info, sink).await;
        }
        let bytes = read_body(response, 0).await?;
        info.mark_first_response();
        let usage = Usage::new(info.prompt_tokens, 0);
        let body = if info.format == RelayFormat::Gemini {
            bytes
        } else {
            let parsed: BatchEmbedResponse = serde_json::from_slice(&bytes)?;
            let value = gemini_embedding_to_openai(parsed, &info.origin_model, info.prompt_tokens);
            Bytes::from(serde_json::to_vec(&value)?)
        };
        sink.start_json(StatusCode::OK)?;
        sink.send(body).await?;
        Ok(usage)
    }
}
