//! # 请求处理器
//!
//! 解析入口协议的请求体，组装 [`RelayInfo`] 后交给编排器或任务管理器。

use axum::Json;
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Extension, Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use super::auth::AuthContext;
use super::state::ServerState;
use crate::adaptor::claude::types::MessagesRequest;
use crate::adaptor::gemini::types::GenerateContentRequest;
use crate::adaptor::openai::types::{ChatRequest, EmbeddingRequest};
use crate::adaptor::usage::{count_tokens, estimate_chat_prompt, estimate_texts};
use crate::adaptor::{FormPart, RequestBody};
use crate::config::RuntimeOptions;
use crate::error::{RelayError, Result};
use crate::recent_calls::CallStart;
use crate::relay::{ClientError, ClientPayload, HEADER_REQUEST_ID, RelayInfo, RelayRequest, new_request_id};
use crate::task::SubmitRequest;
use crate::types::{RelayFormat, RelayMode};

/// 客户端声明请求超时（秒，可带小数）的请求头
const HEADER_CLIENT_TIMEOUT: &str = "x-stainless-timeout";

type Auth = Extension<Arc<AuthContext>>;

/// 解析后的请求体
struct Parsed {
    model: String,
    payload: ClientPayload,
    is_stream: bool,
    include_usage: bool,
    prompt_tokens: u64,
    gemini_action: Option<String>,
}

impl Parsed {
    const fn new(model: String, payload: ClientPayload) -> Self {
        Self {
            model,
            payload,
            is_stream: false,
            include_usage: false,
            prompt_tokens: 0,
            gemini_action: None,
        }
    }
}

fn parse_json<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    serde_json::from_slice(raw)
        .map_err(|e| RelayError::invalid_request(format!("请求体不是合法的 JSON: {e}")))
}

fn model_of(value: &Value) -> Result<String> {
    value
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| RelayError::invalid_request("缺少 model 字段"))
}

fn stream_of(value: &Value) -> bool {
    value.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

/// 请求体整体的 token 估算
fn estimate_raw(raw: &[u8]) -> u64 {
    count_tokens(&String::from_utf8_lossy(raw))
}

/// 客户端超时；非正数或无法解析时忽略
#[must_use]
pub fn client_timeout(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(HEADER_CLIENT_TIMEOUT)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64)
}

fn new_info(
    rid: &str,
    format: RelayFormat,
    mode: RelayMode,
    model: &str,
    options: Arc<RuntimeOptions>,
    auth: &AuthContext,
    uri: &Uri,
) -> RelayInfo {
    let mut info = RelayInfo::new(rid, format, mode, model, options);
    info.user_id = auth.user_id;
    info.token_id = auth.token_id;
    info.user_group.clone_from(&auth.user_group);
    info.using_group.clone_from(&auth.using_group);
    info.client_ip.clone_from(&auth.client_ip);
    info.request_path = uri.path().to_string();
    info.query = uri.query().unwrap_or_default().to_string();
    info
}

#[allow(clippy::too_many_arguments)]
fn build_request(
    state: &ServerState,
    auth: &AuthContext,
    rid: &str,
    format: RelayFormat,
    mode: RelayMode,
    headers: HeaderMap,
    uri: &Uri,
    raw: &[u8],
    parsed: Parsed,
) -> Result<RelayRequest> {
    auth.ensure_model(&parsed.model)?;
    let options = state.options().snapshot();
    let body_json = if options.affinity_rules.is_empty() {
        None
    } else {
        serde_json::from_slice(raw).ok()
    };

    let mut info = new_info(rid, format, mode, &parsed.model, options, auth, uri);
    info.is_stream = parsed.is_stream;
    info.include_usage = parsed.include_usage;
    info.prompt_tokens = parsed.prompt_tokens;
    info.gemini_action = parsed.gemini_action;

    let recent_id = state.relay().recent_calls().record_request(CallStart {
        request_id: rid,
        method: "POST",
        path: uri.path(),
        headers: &headers,
        body: raw,
    });

    Ok(RelayRequest {
        info,
        payload: parsed.payload,
        client_timeout: client_timeout(&headers),
        headers,
        body_json,
        recent_id: Some(recent_id),
    })
}

#[allow(clippy::too_many_arguments)]
async fn relay(
    state: ServerState,
    auth: &AuthContext,
    format: RelayFormat,
    mode: RelayMode,
    headers: HeaderMap,
    uri: &Uri,
    raw: &[u8],
    parsed: Result<Parsed>,
) -> Response {
    let rid = new_request_id();
    let request = parsed.and_then(|parsed| {
        build_request(&state, auth, &rid, format, mode, headers, uri, raw, parsed)
    });
    match request {
        Ok(request) => state.relay().serve(request).await,
        Err(e) => ClientError::new(e, format, rid).into_response(),
    }
}

pub async fn chat_completions(
    State(state): State<ServerState>,
    Extension(auth): Auth,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let parsed = parse_json::<ChatRequest>(&body).map(|request| {
        let is_stream = request.stream.unwrap_or(false);
        let include_usage = request
            .stream_options
            .as_ref()
            .and_then(|o| o.include_usage)
            .unwrap_or(false);
        let prompt_tokens = estimate_chat_prompt(&request);
        let mut parsed = Parsed::new(request.model.clone(), ClientPayload::Chat(request));
        parsed.is_stream = is_stream;
        parsed.include_usage = include_usage;
        parsed.prompt_tokens = prompt_tokens;
        parsed
    });
    relay(state, &auth, RelayFormat::OpenAi, RelayMode::Chat, headers, &uri, &body, parsed).await
}

pub async fn messages(
    State(state): State<ServerState>,
    Extension(auth): Auth,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let parsed = parse_json::<MessagesRequest>(&body).map(|request| {
        let is_stream = request.stream.unwrap_or(false);
        let mut parsed = Parsed::new(request.model.clone(), ClientPayload::Messages(request));
        parsed.is_stream = is_stream;
        parsed.prompt_tokens = estimate_raw(&body);
        parsed
    });
    relay(state, &auth, RelayFormat::Claude, RelayMode::Chat, headers, &uri, &body, parsed).await
}

pub async fn completions(
    State(state): State<ServerState>,
    Extension(auth): Auth,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let parsed = parse_json::<Value>(&body).and_then(|value| {
        let mut parsed = Parsed::new(model_of(&value)?, ClientPayload::Completion(Value::Null));
        parsed.is_stream = stream_of(&value);
        parsed.include_usage = value
            .pointer("/stream_options/include_usage")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        parsed.prompt_tokens = value
            .get("prompt")
            .map_or(0, |p| estimate_raw(p.to_string().as_bytes()));
        parsed.payload = ClientPayload::Completion(value);
        Ok(parsed)
    });
    relay(state, &auth, RelayFormat::OpenAi, RelayMode::Completion, headers, &uri, &body, parsed).await
}

pub async fn embeddings(
    State(state): State<ServerState>,
    Extension(auth): Auth,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let parsed = parse_json::<EmbeddingRequest>(&body).map(|request| {
        let prompt_tokens = estimate_texts(request.input.texts());
        let mut parsed = Parsed::new(request.model.clone(), ClientPayload::Embedding(request));
        parsed.prompt_tokens = prompt_tokens;
        parsed
    });
    relay(state, &auth, RelayFormat::OpenAi, RelayMode::Embedding, headers, &uri, &body, parsed).await
}

pub async fn rerank(
    State(state): State<ServerState>,
    Extension(auth): Auth,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let parsed = parse_json::<Value>(&body).and_then(|value| {
        let mut parsed = Parsed::new(model_of(&value)?, ClientPayload::Rerank(Value::Null));
        parsed.prompt_tokens = estimate_raw(&body);
        parsed.payload = ClientPayload::Rerank(value);
        Ok(parsed)
    });
    relay(state, &auth, RelayFormat::OpenAi, RelayMode::Rerank, headers, &uri, &body, parsed).await
}

pub async fn responses(
    State(state): State<ServerState>,
    Extension(auth): Auth,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let parsed = parse_json::<Value>(&body).and_then(|value| {
        let mut parsed = Parsed::new(model_of(&value)?, ClientPayload::Responses(Value::Null));
        parsed.is_stream = stream_of(&value);
        parsed.prompt_tokens = value
            .get("input")
            .map_or(0, |input| estimate_raw(input.to_string().as_bytes()));
        parsed.payload = ClientPayload::Responses(value);
        Ok(parsed)
    });
    relay(state, &auth, RelayFormat::OpenAi, RelayMode::Responses, headers, &uri, &body, parsed).await
}

pub async fn image_generations(
    State(state): State<ServerState>,
    Extension(auth): Auth,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let parsed = parse_json::<Value>(&body).and_then(|value| {
        let model = model_of(&value)?;
        Ok(Parsed::new(model, ClientPayload::Image(RequestBody::json(&value)?)))
    });
    relay(state, &auth, RelayFormat::OpenAi, RelayMode::ImageGenerate, headers, &uri, &body, parsed).await
}

pub async fn audio_speech(
    State(state): State<ServerState>,
    Extension(auth): Auth,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let parsed = parse_json::<Value>(&body).and_then(|value| {
        let mut parsed = Parsed::new(model_of(&value)?, ClientPayload::Audio(RequestBody::json(&value)?));
        parsed.prompt_tokens = value.get("input").and_then(Value::as_str).map_or(0, count_tokens);
        Ok(parsed)
    });
    relay(state, &auth, RelayFormat::OpenAi, RelayMode::AudioSpeech, headers, &uri, &body, parsed).await
}

/// multipart 表单转为上游请求字段
async fn read_form(mut multipart: Multipart) -> Result<Vec<FormPart>> {
    let mut parts = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RelayError::invalid_request(format!("multipart 解析失败: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(ToString::to_string);
        let content_type = field.content_type().map(ToString::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| RelayError::invalid_request(format!("multipart 字段 {name} 读取失败: {e}")))?;
        parts.push(FormPart {
            name,
            filename,
            content_type,
            data,
        });
    }
    Ok(parts)
}

async fn relay_multipart(
    state: ServerState,
    auth: &AuthContext,
    mode: RelayMode,
    headers: HeaderMap,
    uri: &Uri,
    multipart: Multipart,
) -> Response {
    let parsed = read_form(multipart).await.and_then(|parts| {
        let body = RequestBody::Multipart(parts);
        let model = body
            .form_field("model")
            .filter(|m| !m.is_empty())
            .map(ToString::to_string)
            .ok_or_else(|| RelayError::invalid_request("缺少 model 字段"))?;
        let payload = if mode == RelayMode::ImageEdit {
            ClientPayload::Image(body)
        } else {
            ClientPayload::Audio(body)
        };
        Ok(Parsed::new(model, payload))
    });
    relay(state, auth, RelayFormat::OpenAi, mode, headers, uri, &[], parsed).await
}

pub async fn image_edits(
    State(state): State<ServerState>,
    Extension(auth): Auth,
    headers: HeaderMap,
    uri: Uri,
    multipart: Multipart,
) -> Response {
    relay_multipart(state, &auth, RelayMode::ImageEdit, headers, &uri, multipart).await
}

pub async fn audio_transcriptions(
    State(state): State<ServerState>,
    Extension(auth): Auth,
    headers: HeaderMap,
    uri: Uri,
    multipart: Multipart,
) -> Response {
    relay_multipart(state, &auth, RelayMode::AudioTranscription, headers, &uri, multipart).await
}

pub async fn audio_translations(
    State(state): State<ServerState>,
    Extension(auth): Auth,
    headers: HeaderMap,
    uri: Uri,
    multipart: Multipart,
) -> Response {
    relay_multipart(state, &auth, RelayMode::AudioTranslation, headers, &uri, multipart).await
}

/// `/v1beta/models/{model}:{action}` 的目标拆分
fn split_gemini_target(target: &str) -> Result<(String, String)> {
    target
        .split_once(':')
        .filter(|(model, action)| !model.is_empty() && !action.is_empty())
        .map(|(model, action)| (model.to_string(), action.to_string()))
        .ok_or_else(|| RelayError::invalid_request(format!("无法识别的 Gemini 路径: {target}")))
}

pub async fn gemini(
    State(state): State<ServerState>,
    Extension(auth): Auth,
    Path(target): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let parsed = split_gemini_target(&target).and_then(|(model, action)| {
        let mode = if action.to_ascii_lowercase().contains("embed") {
            RelayMode::Embedding
        } else {
            RelayMode::Chat
        };
        let payload = match action.as_str() {
            "generateContent" | "streamGenerateContent" => {
                ClientPayload::Gemini(parse_json::<GenerateContentRequest>(&body)?)
            }
            _ if body.is_empty() => ClientPayload::Native(json!({})),
            _ => ClientPayload::Native(parse_json::<Value>(&body)?),
        };
        let mut parsed = Parsed::new(model, payload);
        parsed.is_stream = action == "streamGenerateContent";
        parsed.prompt_tokens = estimate_raw(&body);
        parsed.gemini_action = Some(action);
        Ok((mode, parsed))
    });
    match parsed {
        Ok((mode, parsed)) => {
            relay(state, &auth, RelayFormat::Gemini, mode, headers, &uri, &body, Ok(parsed)).await
        }
        Err(e) => ClientError::new(e, RelayFormat::Gemini, new_request_id()).into_response(),
    }
}

pub async fn realtime(
    State(state): State<ServerState>,
    Extension(auth): Auth,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let rid = new_request_id();
    let model = uri
        .query()
        .and_then(|q| url::form_urlencoded::parse(q.as_bytes()).find(|(k, _)| k == "model"))
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default();
    if model.is_empty() {
        return ClientError::new(RelayError::invalid_request("缺少 model 参数"), RelayFormat::OpenAi, rid)
            .into_response();
    }
    if let Err(e) = auth.ensure_model(&model) {
        return ClientError::new(e, RelayFormat::OpenAi, rid).into_response();
    }

    let mut info = new_info(
        &rid,
        RelayFormat::OpenAi,
        RelayMode::Realtime,
        &model,
        state.options().snapshot(),
        &auth,
        &uri,
    );
    info.is_stream = true;
    let relay = state.relay();
    ws.protocols(["realtime"])
        .on_upgrade(move |socket| async move { relay.bridge_realtime(info, socket).await })
}

pub async fn task_submit(
    State(state): State<ServerState>,
    Extension(auth): Auth,
    Path(model): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let rid = new_request_id();
    let submitted = async {
        auth.ensure_model(&model)?;
        let body: Value = parse_json(&body)?;
        let info = new_info(
            &rid,
            RelayFormat::OpenAi,
            RelayMode::TaskSubmit,
            &model,
            state.options().snapshot(),
            &auth,
            &uri,
        );
        state
            .task_manager()
            .submit(SubmitRequest { info, headers, body })
            .await
    }
    .await;

    match submitted {
        Ok(response) => {
            let status = if response.accepted_later {
                StatusCode::NON_AUTHORITATIVE_INFORMATION
            } else {
                StatusCode::OK
            };
            (status, [(HEADER_REQUEST_ID, rid)], Json(response)).into_response()
        }
        Err(e) => ClientError::new(e, RelayFormat::OpenAi, rid).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct FetchBody {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct ListBody {
    #[serde(default)]
    ids: Vec<String>,
}

pub async fn task_fetch(
    State(state): State<ServerState>,
    Extension(auth): Auth,
    body: Bytes,
) -> Response {
    let rid = new_request_id();
    let fetched = async {
        let request: FetchBody = parse_json(&body)?;
        state.task_manager().fetch(auth.user_id, &request.task_id).await
    }
    .await;
    match fetched {
        Ok(view) => ([(HEADER_REQUEST_ID, rid)], Json(view)).into_response(),
        Err(e) => ClientError::new(e, RelayFormat::OpenAi, rid).into_response(),
    }
}

pub async fn task_list(
    State(state): State<ServerState>,
    Extension(auth): Auth,
    body: Bytes,
) -> Response {
    let rid = new_request_id();
    let listed = async {
        let request: ListBody = parse_json(&body)?;
        state.task_manager().list(auth.user_id, &request.ids).await
    }
    .await;
    match listed {
        Ok(views) => ([(HEADER_REQUEST_ID, rid)], Json(views)).into_response(),
        Err(e) => ClientError::new(e, RelayFormat::OpenAi, rid).into_response(),
    }
}

pub async fn health(State(state): State<ServerState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "channels": state.registry().snapshot().len(),
        "in_flight": state.traffic().in_flight(),
    }))
}

pub async fn recent_calls(State(state): State<ServerState>) -> Response {
    Json(state.relay().recent_calls().list()).into_response()
}

pub async fn recent_call(State(state): State<ServerState>, Path(id): Path<u64>) -> Response {
    match state.relay().recent_calls().get(id) {
        Some(call) => Json(call).into_response(),
        None => ClientError::new(
            RelayError::not_found(format!("调用记录 {id} 不存在")),
            RelayFormat::OpenAi,
            new_request_id(),
        )
        .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(Some("30"), Some(Duration::from_secs(30)))]
    #[case(Some("1.5"), Some(Duration::from_millis(1500)))]
    #[case(Some("0"), None)]
    #[case(Some("soon"), None)]
    #[case(None, None)]
    fn test_client_timeout(#[case] raw: Option<&'static str>, #[case] expected: Option<Duration>) {
        let mut headers = HeaderMap::new();
        if let Some(raw) = raw {
            headers.insert(HEADER_CLIENT_TIMEOUT, HeaderValue::from_static(raw));
        }
        assert_eq!(client_timeout(&headers), expected);
    }

    #[test]
    fn test_split_gemini_target() {
        assert_eq!(
            split_gemini_target("gemini-2.0-flash:streamGenerateContent").unwrap(),
            ("gemini-2.0-flash".to_string(), "streamGenerateContent".to_string())
        );
        assert!(split_gemini_target("gemini-2.0-flash").is_err());
        assert!(split_gemini_target(":generateContent").is_err());
    }

    #[test]
    fn test_model_of_requires_model() {
        assert_eq!(model_of(&json!({"model": "gpt-4o"})).unwrap(), "gpt-4o");
        assert!(matches!(
            model_of(&json!({"prompt": "hi"})),
            Err(RelayError::InvalidRequest { .. })
        ));
    }
}
