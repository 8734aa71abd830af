//! # 上游适配器
//!
//! 每种服务商一个适配器：构造上游地址与请求头、转换请求体、发送请求、翻译响应。
//! 跨协议转换统一以 OpenAI 聊天格式为中转。

pub mod claude;
pub mod endpoint;
pub mod gemini;
pub mod image;
pub mod openai;
pub mod reasoning;
pub mod role_map;
pub mod sse;
pub mod stream;
pub mod task;
pub mod usage;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use bytes::Bytes;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use self::claude::ClaudeAdaptor;
use self::claude::types::MessagesRequest;
use self::gemini::GeminiAdaptor;
use self::gemini::types::GenerateContentRequest;
use self::image::ImageFetcher;
use self::openai::OpenAiAdaptor;
use self::openai::types::{ChatRequest, EmbeddingRequest};
use crate::channel::is_insufficient_quota;
use crate::error::{RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::relay::{RelayInfo, ResponseSink};
use crate::types::{ProviderKind, Usage};
use crate::{ldebug, translation_error};

/// 上游错误体最多读取的字节数
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// 转发给上游的来源标识头
pub const HEADER_ORIGIN_USER_ID: &str = "x-origin-user-id";
pub const HEADER_ORIGIN_CHANNEL_ID: &str = "x-origin-channel-id";
pub const HEADER_ORIGIN_TOKEN_ID: &str = "x-origin-token-id";
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
pub const HEADER_RETRY_REQUEST_ID: &str = "retry_request_id";

/// multipart 表单的一个字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl FormPart {
    #[must_use]
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: None,
            content_type: None,
            data: Bytes::from(value.into()),
        }
    }

    /// 文本字段的值
    #[must_use]
    pub fn text_value(&self) -> Option<&str> {
        if self.filename.is_some() {
            return None;
        }
        std::str::from_utf8(&self.data).ok()
    }
}

/// 发往上游的请求体
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Bytes),
    Multipart(Vec<FormPart>),
}

impl RequestBody {
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Json(Bytes::from(serde_json::to_vec(value)?)))
    }

    /// JSON 请求体解析为 `Value`
    pub fn as_value(&self) -> Result<Value> {
        match self {
            Self::Json(bytes) => Ok(serde_json::from_slice(bytes)?),
            Self::Multipart(_) => Err(translation_error!("multipart 请求体不是 JSON")),
        }
    }

    /// multipart 中指定字段的文本值
    #[must_use]
    pub fn form_field(&self, name: &str) -> Option<&str> {
        match self {
            Self::Multipart(parts) => parts
                .iter()
                .find(|p| p.name == name)
                .and_then(FormPart::text_value),
            Self::Json(_) => None,
        }
    }

    /// 替换 JSON 的 `model` 字段或 multipart 的 `model` 字段
    pub fn with_model(self, model: &str) -> Result<Self> {
        match self {
            Self::Json(_) => {
                let mut value = self.as_value()?;
                if let Some(obj) = value.as_object_mut() {
                    obj.insert("model".to_string(), Value::String(model.to_string()));
                }
                Self::json(&value)
            }
            Self::Multipart(mut parts) => {
                for part in &mut parts {
                    if part.name == "model" && part.filename.is_none() {
                        part.data = Bytes::from(model.to_string());
                    }
                }
                Ok(Self::Multipart(parts))
            }
        }
    }
}

/// 不支持的转换
pub(crate) fn unsupported(provider: ProviderKind, what: &str) -> RelayError {
    translation_error!("{} 渠道不支持 {} 请求", provider, what)
}

/// 服务商适配器
#[async_trait]
pub trait Adaptor: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// 剥离模型名后缀，写入推理强度与思考模式
    fn init(&self, info: &mut RelayInfo) {
        let parsed = reasoning::parse_model_suffixes(&info.upstream_model);
        info.upstream_model = parsed.model;
        info.thinking = parsed.thinking;
        if info.reasoning_effort.is_none() {
            info.reasoning_effort = parsed.effort;
        }
    }

    /// 完整上游地址
    fn request_url(&self, info: &RelayInfo) -> Result<String>;

    /// 服务商认证头
    fn auth_headers(&self, info: &RelayInfo, target: &mut HeaderMap) -> Result<()>;

    /// 构造上游请求头
    fn setup_headers(&self, client: &HeaderMap, target: &mut HeaderMap, info: &RelayInfo) -> Result<()> {
        common_headers(client, target, info);
        self.auth_headers(info, target)?;
        apply_header_overrides(target, &info.header_overrides, &info.api_key);
        Ok(())
    }

    async fn convert_openai_request(&self, info: &mut RelayInfo, request: ChatRequest) -> Result<RequestBody>;

    async fn convert_claude_request(&self, info: &mut RelayInfo, request: MessagesRequest) -> Result<RequestBody>;

    async fn convert_gemini_request(
        &self,
        info: &mut RelayInfo,
        request: GenerateContentRequest,
    ) -> Result<RequestBody>;

    async fn convert_completion_request(&self, _info: &mut RelayInfo, _body: Value) -> Result<RequestBody> {
        Err(unsupported(self.provider(), "completion"))
    }

    async fn convert_embedding_request(
        &self,
        _info: &mut RelayInfo,
        _request: EmbeddingRequest,
    ) -> Result<RequestBody> {
        Err(unsupported(self.provider(), "embedding"))
    }

    async fn convert_rerank_request(&self, _info: &mut RelayInfo, _body: Value) -> Result<RequestBody> {
        Err(unsupported(self.provider(), "rerank"))
    }

    async fn convert_audio_request(&self, _info: &mut RelayInfo, _body: RequestBody) -> Result<RequestBody> {
        Err(unsupported(self.provider(), "audio"))
    }

    async fn convert_image_request(&self, _info: &mut RelayInfo, _body: RequestBody) -> Result<RequestBody> {
        Err(unsupported(self.provider(), "image"))
    }

    async fn convert_responses_request(&self, _info: &mut RelayInfo, _body: Value) -> Result<RequestBody> {
        Err(unsupported(self.provider(), "responses"))
    }

    /// 发送请求；非 2xx 响应解析为上游错误
    async fn do_request(
        &self,
        client: &Client,
        info: &RelayInfo,
        headers: HeaderMap,
        body: RequestBody,
    ) -> Result<reqwest::Response> {
        let url = self.request_url(info)?;
        send_request(client, &url, headers, body).await
    }

    /// 读取、翻译并转发响应，返回用量
    async fn do_response(
        &self,
        response: reqwest::Response,
        info: &mut RelayInfo,
        sink: &mut ResponseSink,
    ) -> Result<Usage> {
        stream::relay_chat_response(response, info, sink).await
    }
}

/// 复制内容协商头并附加来源标识
pub fn common_headers(client: &HeaderMap, target: &mut HeaderMap, info: &RelayInfo) {
    for name in [header::CONTENT_TYPE, header::ACCEPT] {
        if let Some(value) = client.get(&name) {
            target.insert(name, value.clone());
        }
    }
    if info.is_stream {
        target.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));
    }
    let pairs = [
        (HEADER_ORIGIN_USER_ID, info.user_id.to_string()),
        (HEADER_ORIGIN_CHANNEL_ID, info.channel_id.to_string()),
        (HEADER_ORIGIN_TOKEN_ID, info.token_id.to_string()),
        (HEADER_RETRY_COUNT, info.retry_count.to_string()),
        (HEADER_RETRY_REQUEST_ID, info.retry_request_id.clone()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            target.insert(HeaderName::from_static(name), value);
        }
    }
}

/// 渠道配置的请求头覆盖，`{api_key}` 替换为当前密钥
pub fn apply_header_overrides(target: &mut HeaderMap, overrides: &HashMap<String, String>, api_key: &str) {
    for (name, value) in overrides {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()),
            HeaderValue::from_str(&value.replace("{api_key}", api_key)),
        ) else {
            continue;
        };
        target.insert(name, value);
    }
}

/// 插入一个认证头
pub(crate) fn insert_secret(target: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
        .map_err(|e| RelayError::config(format!("认证头名称无效: {e}")))?;
    let mut value = HeaderValue::from_str(value)
        .map_err(|_| RelayError::config("渠道密钥包含非法字符"))?;
    value.set_sensitive(true);
    target.insert(name, value);
    Ok(())
}

/// 发送 HTTP 请求，检查状态码
pub async fn send_request(
    client: &Client,
    url: &str,
    mut headers: HeaderMap,
    body: RequestBody,
) -> Result<reqwest::Response> {
    let builder = client.post(url);
    let builder = match body {
        RequestBody::Json(bytes) => {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            builder.headers(headers).body(bytes)
        }
        RequestBody::Multipart(parts) => {
            // 由 reqwest 生成带 boundary 的 content-type
            headers.remove(header::CONTENT_TYPE);
            headers.remove(header::CONTENT_LENGTH);
            builder.headers(headers).multipart(build_form(parts)?)
        }
    };
    let response = builder.send().await?;
    check_status(response).await
}

fn build_form(parts: Vec<FormPart>) -> Result<reqwest::multipart::Form> {
    let mut form = reqwest::multipart::Form::new();
    for part in parts {
        let mut field = reqwest::multipart::Part::bytes(part.data.to_vec());
        if let Some(filename) = part.filename {
            field = field.file_name(filename);
        }
        if let Some(content_type) = part.content_type {
            field = field
                .mime_str(&content_type)
                .map_err(|e| translation_error!("表单字段类型无效: {}", e))?;
        }
        form = form.part(part.name, field);
    }
    Ok(form)
}

/// 2xx 原样返回；否则读取错误体并解析
pub async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = read_capped(response, MAX_ERROR_BODY_BYTES).await.unwrap_or_default();
    let error = parse_upstream_error(status.as_u16(), &body);
    ldebug!(
        "system",
        LogStage::UpstreamRequest,
        LogComponent::Adaptor,
        "upstream_error",
        "上游返回错误状态",
        status = status.as_u16(),
        error = %error
    );
    Err(error)
}

/// 读取响应体，超过上限时截断
pub async fn read_capped(mut response: reqwest::Response, max_bytes: usize) -> Result<Bytes> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = max_bytes.saturating_sub(body.len());
        if room == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
    Ok(Bytes::from(body))
}

/// 读取完整响应体，超过上限视为错误
pub async fn read_body(mut response: reqwest::Response, max_bytes: u64) -> Result<Bytes> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if max_bytes > 0 && (body.len() + chunk.len()) as u64 > max_bytes {
            return Err(RelayError::internal(format!("上游响应超过大小上限 {max_bytes} 字节")));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(body))
}

/// 解析三种协议的错误体
///
/// OpenAI `{error:{message,type,code}}`，Claude `{type:"error",error:{type,message}}`，
/// Gemini `{error:{code,message,status}}`。无法解析时以原文作为消息。
#[must_use]
pub fn parse_upstream_error(status: u16, body: &[u8]) -> RelayError {
    let text = String::from_utf8_lossy(body).trim().to_string();
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));

    let (message, error_type, code) = match error {
        Some(Value::Object(obj)) => {
            let message = obj
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or(&text)
                .to_string();
            let error_type = obj
                .get("type")
                .or_else(|| obj.get("status"))
                .and_then(Value::as_str)
                .map(ToString::to_string);
            let code = obj.get("code").and_then(|c| match c {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
            (message, error_type, code)
        }
        Some(Value::String(message)) => (message.clone(), None, None),
        _ => {
            let message = parsed
                .as_ref()
                .and_then(|v| v.get("message"))
                .and_then(Value::as_str)
                .map_or_else(|| text.clone(), ToString::to_string);
            (message, None, None)
        }
    };
    let message = if message.is_empty() {
        format!("上游返回状态 {status}")
    } else {
        message
    };

    RelayError::Upstream {
        status,
        insufficient_quota: is_insufficient_quota(error_type.as_deref(), code.as_deref(), &message),
        message,
        error_type,
        code,
    }
}

/// 各服务商的适配器集合
#[derive(Clone)]
pub struct AdaptorSet {
    openai: Arc<OpenAiAdaptor>,
    claude: Arc<ClaudeAdaptor>,
    gemini: Arc<GeminiAdaptor>,
}

impl AdaptorSet {
    #[must_use]
    pub fn new(images: ImageFetcher, header_key_overrides: &HashMap<String, String>) -> Self {
        let header_for = |provider: &str| header_key_overrides.get(provider).cloned();
        Self {
            openai: Arc::new(OpenAiAdaptor::new(header_for("openai"))),
            claude: Arc::new(ClaudeAdaptor::new(images.clone(), header_for("anthropic"))),
            gemini: Arc::new(GeminiAdaptor::new(images, header_for("gemini"))),
        }
    }

    /// 服务商对应的适配器；任务平台走独立的任务适配器
    pub fn adaptor_for(&self, provider: ProviderKind) -> Result<Arc<dyn Adaptor>> {
        match provider {
            ProviderKind::OpenAi => Ok(self.openai.clone()),
            ProviderKind::Anthropic => Ok(self.claude.clone()),
            ProviderKind::Gemini => Ok(self.gemini.clone()),
            ProviderKind::Task => Err(translation_error!("任务渠道不能用于同步转发")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(
        401,
        r#"{"error":{"message":"Incorrect API key","type":"invalid_request_error","code":"invalid_api_key"}}"#,
        "Incorrect API key",
        Some("invalid_request_error"),
        false
    )]
    #[case(
        429,
        r#"{"error":{"message":"You exceeded your current quota","type":"insufficient_quota","code":"insufficient_quota"}}"#,
        "You exceeded your current quota",
        Some("insufficient_quota"),
        true
    )]
    #[case(
        400,
        r#"{"type":"error","error":{"type":"invalid_request_error","message":"Your credit balance is too low"}}"#,
        "Your credit balance is too low",
        Some("invalid_request_error"),
        true
    )]
    #[case(
        403,
        r#"{"error":{"code":403,"message":"Permission denied","status":"PERMISSION_DENIED"}}"#,
        "Permission denied",
        Some("PERMISSION_DENIED"),
        false
    )]
    #[case(502, "Bad Gateway", "Bad Gateway", None, false)]
    fn test_parse_upstream_error(
        #[case] status: u16,
        #[case] body: &str,
        #[case] message: &str,
        #[case] error_type: Option<&str>,
        #[case] quota: bool,
    ) {
        match parse_upstream_error(status, body.as_bytes()) {
            RelayError::Upstream {
                status: s,
                message: m,
                error_type: t,
                insufficient_quota,
                ..
            } => {
                assert_eq!(s, status);
                assert_eq!(m, message);
                assert_eq!(t.as_deref(), error_type);
                assert_eq!(insufficient_quota, quota);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_with_model_rewrites_json_and_form() {
        let body = RequestBody::json(&serde_json::json!({"model": "a", "input": "x"})).unwrap();
        let value = body.with_model("b").unwrap().as_value().unwrap();
        assert_eq!(value["model"], "b");

        let form = RequestBody::Multipart(vec![
            FormPart::text("model", "whisper"),
            FormPart {
                name: "file".into(),
                filename: Some("a.wav".into()),
                content_type: Some("audio/wav".into()),
                data: Bytes::from_static(b"RIFF"),
            },
        ]);
        let form = form.with_model("whisper-1").unwrap();
        assert_eq!(form.form_field("model"), Some("whisper-1"));
        assert_eq!(form.form_field("file"), None);
    }

    #[test]
    fn test_header_overrides() {
        let mut headers = HeaderMap::new();
        let overrides = HashMap::from([
            ("X-Custom".to_string(), "1".to_string()),
            ("X-Upstream-Key".to_string(), "Key {api_key}".to_string()),
        ]);
        apply_header_overrides(&mut headers, &overrides, "sk-1");
        assert_eq!(headers.get("x-custom").unwrap(), "1");
        assert_eq!(headers.get("x-upstream-key").unwrap(), "Key sk-1");
    }
}
