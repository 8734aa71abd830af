//! # OpenAI 兼容适配器
//!
//! 聊天请求可能来自三种客户端协议；其余模式（补全、向量、图片、音频、重排、Responses）
//! 只替换模型名后原样转发，响应同样原样返回并从中解析用量。

pub mod stream;
pub mod types;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use futures::StreamExt;
use serde_json::Value;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use self::types::{ChatRequest, EmbeddingRequest, StreamOptions};
use super::claude::convert::claude_to_openai_request;
use super::claude::types::MessagesRequest;
use super::endpoint::{ChannelEndpoints, EndpointKey};
use super::gemini::convert::gemini_to_openai_request;
use super::gemini::types::GenerateContentRequest;
use super::role_map::apply_role_mapping;
use super::sse::SseDecoder;
use super::stream::{StreamCollector, relay_chat_response, settle_usage};
use super::usage::extract_usage;
use super::{Adaptor, RequestBody, insert_secret, read_body};
use crate::error::{NetworkClass, RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::relay::{RelayInfo, ResponseSink};
use crate::types::{ProviderKind, RelayFormat, RelayMode, Usage};
use crate::{ldebug, lwarn};

/// 各模式在 OpenAI 上游的默认路径
#[must_use]
pub const fn default_path(mode: RelayMode) -> &'static str {
    match mode {
        RelayMode::Completion => "/v1/completions",
        RelayMode::Embedding => "/v1/embeddings",
        RelayMode::ImageGenerate => "/v1/images/generations",
        RelayMode::ImageEdit => "/v1/images/edits",
        RelayMode::AudioSpeech => "/v1/audio/speech",
        RelayMode::AudioTranscription => "/v1/audio/transcriptions",
        RelayMode::AudioTranslation => "/v1/audio/translations",
        RelayMode::Rerank => "/v1/rerank",
        RelayMode::Realtime => "/v1/realtime",
        RelayMode::Responses => "/v1/responses",
        _ => "/v1/chat/completions",
    }
}

pub struct OpenAiAdaptor {
    /// 为空时使用 `Authorization: Bearer`
    key_header: Option<String>,
}

impl OpenAiAdaptor {
    #[must_use]
    pub const fn new(key_header: Option<String>) -> Self {
        Self { key_header }
    }

    fn finish_chat(info: &mut RelayInfo, mut request: ChatRequest) -> Result<RequestBody> {
        apply_role_mapping(&info.options.role_mapping, &info.upstream_model, &mut request.messages);
        request.model.clone_from(&info.upstream_model);
        if info.is_stream {
            request.stream = Some(true);
            // 总是要求末尾用量块，客户端未要求时转发时丢弃
            request.stream_options = Some(StreamOptions {
                include_usage: Some(true),
            });
        } else {
            request.stream = None;
            request.stream_options = None;
        }
        if request.reasoning_effort.is_none() {
            request.reasoning_effort.clone_from(&info.reasoning_effort);
        }
        RequestBody::json(&request)
    }

    fn replace_model(info: &RelayInfo, mut body: Value) -> Result<RequestBody> {
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".to_string(), Value::String(info.upstream_model.clone()));
            if info.mode == RelayMode::Completion && info.is_stream {
                obj.insert("stream_options".to_string(), serde_json::json!({"include_usage": true}));
            }
        }
        RequestBody::json(&body)
    }
}

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn request_url(&self, info: &RelayInfo) -> Result<String> {
        let (path, query) = if info.format == RelayFormat::OpenAi && info.request_path.starts_with("/v1/") {
            (info.request_path.as_str(), info.query.clone())
        } else {
            (default_path(info.mode), String::new())
        };
        let query = if info.mode == RelayMode::Realtime && query.is_empty() {
            format!("model={}", info.upstream_model)
        } else {
            query
        };
        ChannelEndpoints::parse(&info.base_url)?.resolve(
            EndpointKey::classify(info.mode, RelayFormat::OpenAi),
            &info.upstream_model,
            path,
            &query,
        )
    }

    fn auth_headers(&self, info: &RelayInfo, target: &mut HeaderMap) -> Result<()> {
        match &self.key_header {
            Some(name) => insert_secret(target, name, &info.api_key),
            None => insert_secret(target, header::AUTHORIZATION.as_str(), &format!("Bearer {}", info.api_key)),
        }
    }

    async fn convert_openai_request(&self, info: &mut RelayInfo, request: ChatRequest) -> Result<RequestBody> {
        Self::finish_chat(info, request)
    }

    async fn convert_claude_request(&self, info: &mut RelayInfo, request: MessagesRequest) -> Result<RequestBody> {
        let mut chat = claude_to_openai_request(request);
        if info.thinking && chat.reasoning_effort.is_none() {
            chat.reasoning_effort = Some("high".to_string());
        }
        Self::finish_chat(info, chat)
    }

    async fn convert_gemini_request(
        &self,
        info: &mut RelayInfo,
        request: GenerateContentRequest,
    ) -> Result<RequestBody> {
        let chat = gemini_to_openai_request(request, &info.upstream_model);
        Self::finish_chat(info, chat)
    }

    async fn convert_completion_request(&self, info: &mut RelayInfo, body: Value) -> Result<RequestBody> {
        Self::replace_model(info, body)
    }

    async fn convert_embedding_request(
        &self,
        info: &mut RelayInfo,
        mut request: EmbeddingRequest,
    ) -> Result<RequestBody> {
        request.model.clone_from(&info.upstream_model);
        RequestBody::json(&request)
    }

    async fn convert_rerank_request(&self, info: &mut RelayInfo, body: Value) -> Result<RequestBody> {
        Self::replace_model(info, body)
    }

    async fn convert_audio_request(&self, info: &mut RelayInfo, body: RequestBody) -> Result<RequestBody> {
        body.with_model(&info.upstream_model)
    }

    async fn convert_image_request(&self, info: &mut RelayInfo, body: RequestBody) -> Result<RequestBody> {
        body.with_model(&info.upstream_model)
    }

    async fn convert_responses_request(&self, info: &mut RelayInfo, body: Value) -> Result<RequestBody> {
        Self::replace_model(info, body)
    }

    async fn do_response(
        &self,
        response: reqwest::Response,
        info: &mut RelayInfo,
        sink: &mut ResponseSink,
    ) -> Result<Usage> {
        match info.mode {
            RelayMode::Chat => relay_chat_response(response, info, sink).await,
            _ if info.is_stream => relay_passthrough_stream(response, info, sink).await,
            _ => relay_passthrough_whole(response, info, sink).await,
        }
    }
}

/// 非聊天类响应中可计为输出的文本
fn output_text(value: &Value) -> String {
    let mut text = String::new();
    if let Some(choices) = value.get("choices").and_then(Value::as_array) {
        for choice in choices {
            for pointer in ["/text", "/delta/content", "/message/content"] {
                if let Some(fragment) = choice.pointer(pointer).and_then(Value::as_str) {
                    text.push_str(fragment);
                }
            }
        }
    }
    // Responses 流的增量事件
    if value
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.ends_with("output_text.delta"))
    {
        if let Some(delta) = value.get("delta").and_then(Value::as_str) {
            text.push_str(delta);
        }
    }
    text
}

/// 网关强制要求的纯用量块
fn is_usage_only(value: &Value) -> bool {
    value.get("usage").is_some_and(|u| u.is_object())
        && value
            .get("choices")
            .and_then(Value::as_array)
            .is_some_and(Vec::is_empty)
}

async fn relay_passthrough_stream(
    response: reqwest::Response,
    info: &mut RelayInfo,
    sink: &mut ResponseSink,
) -> Result<Usage> {
    let body = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    let mut events = FramedRead::new(StreamReader::new(body), SseDecoder::new());
    let cancel = sink.cancel_token().clone();
    info.partial = StreamCollector::default();

    sink.start_sse()?;
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RelayError::ClientGone),
            next = events.next() => next,
        };
        let event = match next {
            None => break,
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                lwarn!(
                    info.request_id,
                    LogStage::Response,
                    LogComponent::OpenAiAdaptor,
                    "stream_interrupted",
                    "上游流中断",
                    error = %e
                );
                break;
            }
        };
        info.mark_first_response();
        let mut hidden = false;
        if let Some(value) = event.json() {
            if let Some(usage) = extract_usage(&value) {
                info.partial.report_usage(usage);
            }
            info.partial.push_text(&output_text(&value));
            hidden = info.mode == RelayMode::Completion && !info.include_usage && is_usage_only(&value);
        }
        if !hidden {
            sink.send(event.to_bytes()).await?;
        }
    }
    Ok(info.partial.settle(info.prompt_tokens))
}

async fn relay_passthrough_whole(
    response: reqwest::Response,
    info: &mut RelayInfo,
    sink: &mut ResponseSink,
) -> Result<Usage> {
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| HeaderValue::from_bytes(v.as_bytes()).ok());
    let bytes = read_body(response, 0).await?;
    if bytes.is_empty() && info.mode != RelayMode::AudioSpeech {
        return Err(RelayError::network("上游返回空响应", NetworkClass::EmptyResponse));
    }
    info.mark_first_response();

    let usage = if info.mode == RelayMode::AudioSpeech {
        // 语音合成按输入文本计费
        Usage::new(info.prompt_tokens, 0)
    } else {
        let parsed: Option<Value> = serde_json::from_slice(&bytes).ok();
        let reported = parsed.as_ref().and_then(extract_usage);
        let text = parsed.as_ref().map(output_text).unwrap_or_default();
        settle_usage(reported, info.prompt_tokens, &text)
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        content_type.unwrap_or_else(|| HeaderValue::from_static("application/json")),
    );
    ldebug!(
        info.request_id,
        LogStage::Response,
        LogComponent::OpenAiAdaptor,
        "passthrough_complete",
        "响应原样转发完成",
        mode = info.mode.as_str(),
        bytes = bytes.len(),
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens
    );
    sink.send_full(status, headers, bytes).await?;
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::openai::types::ChatMessage;
    use crate::config::RuntimeOptions;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Arc;

    fn info(format: RelayFormat, mode: RelayMode, path: &str) -> RelayInfo {
        let mut info = RelayInfo::new("req-1", format, mode, "gpt-4o", Arc::new(RuntimeOptions::default()));
        info.base_url = "https://api.openai.com/".into();
        info.api_key = "sk-test".into();
        info.request_path = path.into();
        info
    }

    #[rstest]
    #[case(RelayFormat::OpenAi, RelayMode::Chat, "/v1/chat/completions", "https://api.openai.com/v1/chat/completions")]
    #[case(RelayFormat::Claude, RelayMode::Chat, "/v1/messages", "https://api.openai.com/v1/chat/completions")]
    #[case(RelayFormat::OpenAi, RelayMode::Embedding, "/v1/embeddings", "https://api.openai.com/v1/embeddings")]
    #[case(
        RelayFormat::OpenAi,
        RelayMode::Realtime,
        "/v1/realtime",
        "wss://api.openai.com/v1/realtime?model=gpt-4o"
    )]
    fn test_request_url(
        #[case] format: RelayFormat,
        #[case] mode: RelayMode,
        #[case] path: &str,
        #[case] expected: &str,
    ) {
        let url = OpenAiAdaptor::new(None).request_url(&info(format, mode, path)).unwrap();
        assert_eq!(url, expected);
    }

    #[test]
    fn test_bearer_and_custom_header() {
        let info = info(RelayFormat::OpenAi, RelayMode::Chat, "/v1/chat/completions");
        let mut headers = HeaderMap::new();
        OpenAiAdaptor::new(None).auth_headers(&info, &mut headers).unwrap();
        assert_eq!(headers[header::AUTHORIZATION], "Bearer sk-test");

        let mut headers = HeaderMap::new();
        OpenAiAdaptor::new(Some("api-key".into()))
            .auth_headers(&info, &mut headers)
            .unwrap();
        assert_eq!(headers["api-key"], "sk-test");
        assert!(!headers.contains_key(header::AUTHORIZATION));
    }

    #[tokio::test]
    async fn test_stream_forces_usage() {
        let mut info = info(RelayFormat::OpenAi, RelayMode::Chat, "/v1/chat/completions");
        info.is_stream = true;
        info.upstream_model = "gpt-4o-2024-08-06".into();
        let request = ChatRequest {
            model: "gpt-4o".into(),
            messages: vec![ChatMessage::text("user", "hi")],
            stream: Some(true),
            ..ChatRequest::default()
        };
        let body = OpenAiAdaptor::new(None)
            .convert_openai_request(&mut info, request)
            .await
            .unwrap();
        let value = body.as_value().unwrap();
        assert_eq!(value["model"], "gpt-4o-2024-08-06");
        assert_eq!(value["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_output_text_and_usage_only() {
        let completion = json!({"choices": [{"text": "abc"}]});
        assert_eq!(output_text(&completion), "abc");
        let responses = json!({"type": "response.output_text.delta", "delta": "xy"});
        assert_eq!(output_text(&responses), "xy");
        assert!(is_usage_only(&json!({"choices": [], "usage": {"prompt_tokens": 1}})));
        assert!(!is_usage_only(&completion));
    }
}
