//! # OpenAI ⇄ Gemini 转换

use serde_json::{Map, Value, json};
use std::collections::{HashMap, VecDeque};

use super::types::{
    BatchEmbedRequest, BatchEmbedResponse, Blob, Candidate, Content, EmbedContentRequest,
    FunctionCall as GeminiCall, FunctionCallingConfig, FunctionDeclaration, FunctionResponse,
    GeminiTool, GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part,
    ThinkingConfig, ToolConfig, UsageMetadata,
};
use crate::adaptor::image::ImageFetcher;
use crate::adaptor::openai::types::{
    ChatMessage, ChatRequest, ChatResponse, Choice, ContentPart, EmbeddingRequest, FunctionDef,
    FunctionName, ImageUrl, MessageContent, NamedToolChoice, StopSequences, Tool, ToolCall,
    ToolChoice,
};
use crate::adaptor::reasoning::{budget_for_effort, effort_for_budget, thinking_budget};
use crate::error::Result;
use crate::translation_error;
use crate::types::{Usage, now_timestamp};

/// 安全类结束原因
const BLOCKED_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
    "IMAGE_SAFETY",
];

/// Gemini `finishReason` → OpenAI `finish_reason`
#[must_use]
pub fn finish_reason_from_gemini(reason: Option<&str>, has_calls: bool) -> Option<&'static str> {
    let reason = reason?;
    Some(match reason {
        "MAX_TOKENS" => "length",
        r if BLOCKED_REASONS.contains(&r) => "content_filter",
        _ if has_calls => "tool_calls",
        _ => "stop",
    })
}

/// OpenAI `finish_reason` → Gemini `finishReason`
#[must_use]
pub fn finish_reason_to_gemini(reason: Option<&str>) -> &'static str {
    match reason {
        Some("length") => "MAX_TOKENS",
        Some("content_filter") => "SAFETY",
        _ => "STOP",
    }
}

/// 去掉 Gemini 不接受的 JSON Schema 字段
pub fn clean_schema(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            map.remove("$schema");
            map.remove("additionalProperties");
            for value in map.values_mut() {
                clean_schema(value);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(clean_schema),
        _ => {}
    }
}

fn push_content(contents: &mut Vec<Content>, role: &str, parts: Vec<Part>) {
    if parts.is_empty() {
        return;
    }
    if let Some(last) = contents.last_mut().filter(|c| c.role.as_deref() == Some(role)) {
        last.parts.extend(parts);
        return;
    }
    contents.push(Content::new(role, parts));
}

async fn convert_parts(content: MessageContent, images: &ImageFetcher) -> Result<Vec<Part>> {
    let mut parts = Vec::new();
    for part in content.into_parts() {
        match part {
            ContentPart::Text { text } if !text.is_empty() => parts.push(Part::text(text)),
            ContentPart::ImageUrl { image_url } => {
                let image = images.resolve(&image_url.url).await?;
                parts.push(Part {
                    inline_data: Some(Blob {
                        mime_type: image.mime_type,
                        data: image.data,
                    }),
                    ..Part::default()
                });
            }
            _ => {}
        }
    }
    Ok(parts)
}

fn tool_response_value(text: &str) -> Value {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(obj)) => Value::Object(obj),
        _ => json!({ "content": text }),
    }
}

fn convert_response_format(format: &Value, config: &mut GenerationConfig) {
    match format.get("type").and_then(Value::as_str) {
        Some("json_object") => config.response_mime_type = Some("application/json".to_string()),
        Some("json_schema") => {
            config.response_mime_type = Some("application/json".to_string());
            if let Some(mut schema) = format.pointer("/json_schema/schema").cloned() {
                clean_schema(&mut schema);
                config.response_schema = Some(schema);
            }
        }
        _ => {}
    }
}

/// OpenAI 聊天请求 → generateContent 请求
///
/// tool 消息转为用户轮次的 `functionResponse`，函数名按 `tool_call_id` 回查之前的调用。
pub async fn openai_to_gemini_request(
    request: ChatRequest,
    images: &ImageFetcher,
) -> Result<GenerateContentRequest> {
    let mut system = Vec::new();
    let mut contents: Vec<Content> = Vec::new();
    let mut call_names: HashMap<String, String> = HashMap::new();

    let mut config = GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        candidate_count: request.n,
        max_output_tokens: request.output_limit(),
        stop_sequences: request.stop.clone().map(StopSequences::into_vec),
        ..GenerationConfig::default()
    };
    if let Some(format) = &request.response_format {
        convert_response_format(format, &mut config);
    }

    for message in request.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                let text = message.text_content();
                if !text.is_empty() {
                    system.push(Part::text(text));
                }
            }
            "tool" | "function" => {
                let id = message.tool_call_id.clone().unwrap_or_default();
                let name = call_names
                    .get(&id)
                    .cloned()
                    .or_else(|| message.name.clone())
                    .unwrap_or_default();
                let part = Part {
                    function_response: Some(FunctionResponse {
                        name,
                        response: tool_response_value(&message.text_content()),
                    }),
                    ..Part::default()
                };
                push_content(&mut contents, "user", vec![part]);
            }
            "assistant" => {
                let mut parts = match message.content {
                    Some(content) => convert_parts(content, images).await?,
                    None => Vec::new(),
                };
                for call in message.tool_calls.into_iter().flatten() {
                    call_names.insert(call.id.clone(), call.function.name.clone());
                    let args = serde_json::from_str::<Value>(&call.function.arguments)
                        .ok()
                        .filter(Value::is_object)
                        .unwrap_or_else(|| json!({}));
                    parts.push(Part {
                        function_call: Some(GeminiCall {
                            name: call.function.name,
                            args,
                        }),
                        ..Part::default()
                    });
                }
                push_content(&mut contents, "model", parts);
            }
            _ => {
                let parts = match message.content {
                    Some(content) => convert_parts(content, images).await?,
                    None => Vec::new(),
                };
                push_content(&mut contents, "user", parts);
            }
        }
    }

    if contents.is_empty() {
        return Err(translation_error!("请求中没有可发送给 Gemini 的消息"));
    }

    let tools = request
        .tools
        .map(|tools| {
            tools
                .into_iter()
                .map(|tool| {
                    let parameters = tool.function.parameters.map(|mut schema| {
                        clean_schema(&mut schema);
                        schema
                    });
                    FunctionDeclaration {
                        name: tool.function.name,
                        description: tool.function.description,
                        parameters,
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|declarations| !declarations.is_empty())
        .map(|declarations| {
            vec![GeminiTool {
                function_declarations: Some(declarations),
                extra: Map::new(),
            }]
        });

    let tool_config = request.tool_choice.map(|choice| {
        let config = match choice {
            ToolChoice::Mode(mode) => FunctionCallingConfig {
                mode: match mode.as_str() {
                    "required" => "ANY",
                    "none" => "NONE",
                    _ => "AUTO",
                }
                .to_string(),
                allowed_function_names: None,
            },
            ToolChoice::Named(named) => FunctionCallingConfig {
                mode: "ANY".to_string(),
                allowed_function_names: Some(vec![named.function.name]),
            },
        };
        ToolConfig {
            function_calling_config: Some(config),
        }
    });

    Ok(GenerateContentRequest {
        contents,
        system_instruction: (!system.is_empty()).then(|| Content {
            role: None,
            parts: system,
        }),
        generation_config: Some(config),
        tools,
        tool_config,
        safety_settings: None,
        extra: Map::new(),
    })
}

/// 按思考模式或推理强度设置 `thinkingConfig`
pub fn apply_thinking(request: &mut GenerateContentRequest, thinking: bool, effort: Option<&str>, percentage: f64) {
    let config = request.generation_config.get_or_insert_with(GenerationConfig::default);
    let budget = if thinking {
        let max_tokens = config.max_output_tokens.unwrap_or(crate::adaptor::claude::convert::DEFAULT_MAX_TOKENS);
        thinking_budget(max_tokens, percentage)
    } else if let Some(budget) = effort.and_then(budget_for_effort) {
        budget
    } else {
        return;
    };
    config.thinking_config = Some(ThinkingConfig {
        thinking_budget: Some(budget),
        include_thoughts: Some(true),
    });
}

/// generateContent 请求 → OpenAI 聊天请求
///
/// 调用 ID 由网关生成；`functionResponse` 按函数名依次认领之前的调用 ID。
#[must_use]
pub fn gemini_to_openai_request(request: GenerateContentRequest, model: &str) -> ChatRequest {
    let mut messages = Vec::new();
    if let Some(system) = request.system_instruction.as_ref().map(Content::text).filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::text("system", system));
    }

    let mut pending: HashMap<String, VecDeque<String>> = HashMap::new();
    let mut call_seq = 0usize;
    for content in request.contents {
        if content.role.as_deref() == Some("model") {
            let mut text = String::new();
            let mut reasoning = String::new();
            let mut calls = Vec::new();
            for part in content.parts {
                if let Some(call) = part.function_call {
                    call_seq += 1;
                    let id = format!("call_{call_seq}");
                    pending.entry(call.name.clone()).or_default().push_back(id.clone());
                    calls.push(ToolCall::function(id, call.name, call.args.to_string()));
                } else if let Some(t) = part.text {
                    if part.thought.unwrap_or(false) {
                        reasoning.push_str(&t);
                    } else {
                        text.push_str(&t);
                    }
                }
            }
            messages.push(ChatMessage {
                role: "assistant".to_string(),
                content: (!text.is_empty() || calls.is_empty()).then_some(MessageContent::Text(text)),
                tool_calls: (!calls.is_empty()).then_some(calls),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                ..ChatMessage::default()
            });
            continue;
        }

        let mut parts = Vec::new();
        for part in content.parts {
            if let Some(response) = part.function_response {
                let id = pending
                    .get_mut(&response.name)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(|| {
                        call_seq += 1;
                        format!("call_{call_seq}")
                    });
                messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(MessageContent::Text(response.response.to_string())),
                    name: Some(response.name),
                    tool_call_id: Some(id),
                    ..ChatMessage::default()
                });
            } else if let Some(blob) = part.inline_data {
                parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{};base64,{}", blob.mime_type, blob.data),
                        detail: None,
                    },
                });
            } else if let Some(text) = part.text {
                parts.push(ContentPart::Text { text });
            }
        }
        if parts.is_empty() {
            continue;
        }
        let content = match parts.as_slice() {
            [ContentPart::Text { text }] => MessageContent::Text(text.clone()),
            _ => MessageContent::Parts(parts),
        };
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: Some(content),
            ..ChatMessage::default()
        });
    }

    let config = request.generation_config.unwrap_or_default();
    let response_format = match (&config.response_mime_type, &config.response_schema) {
        (_, Some(schema)) => Some(json!({
            "type": "json_schema",
            "json_schema": {"name": "response", "schema": schema}
        })),
        (Some(mime), None) if mime == "application/json" => Some(json!({"type": "json_object"})),
        _ => None,
    };
    let reasoning_effort = config
        .thinking_config
        .and_then(|t| t.thinking_budget)
        .filter(|budget| *budget > 0)
        .map(|budget| effort_for_budget(budget).to_string());

    let tools: Vec<Tool> = request
        .tools
        .into_iter()
        .flatten()
        .flat_map(|tool| tool.function_declarations.unwrap_or_default())
        .map(|decl| Tool {
            kind: "function".to_string(),
            function: FunctionDef {
                name: decl.name,
                description: decl.description,
                parameters: decl.parameters,
            },
        })
        .collect();

    let tool_choice = request
        .tool_config
        .and_then(|c| c.function_calling_config)
        .map(|config| match config.mode.as_str() {
            "ANY" => match config.allowed_function_names.as_deref() {
                Some([name]) => ToolChoice::Named(NamedToolChoice {
                    kind: "function".to_string(),
                    function: FunctionName { name: name.clone() },
                }),
                _ => ToolChoice::Mode("required".to_string()),
            },
            "NONE" => ToolChoice::Mode("none".to_string()),
            _ => ToolChoice::Mode("auto".to_string()),
        });

    ChatRequest {
        model: model.to_string(),
        messages,
        max_tokens: config.max_output_tokens,
        temperature: config.temperature,
        top_p: config.top_p,
        n: config.candidate_count,
        stop: config.stop_sequences.map(StopSequences::Many),
        tools: (!tools.is_empty()).then_some(tools),
        tool_choice,
        reasoning_effort,
        response_format,
        ..ChatRequest::default()
    }
}

/// generateContent 响应 → OpenAI 响应
#[must_use]
pub fn gemini_to_openai_response(response: GenerateContentResponse, model: &str) -> ChatResponse {
    let usage = response.usage_metadata.map(Usage::from).unwrap_or_default();
    let choices = response
        .candidates
        .into_iter()
        .map(|candidate| {
            let mut text = String::new();
            let mut reasoning = String::new();
            let mut calls = Vec::new();
            for part in candidate.content.parts {
                if let Some(call) = part.function_call {
                    let id = format!("call_{}", calls.len() + 1);
                    calls.push(ToolCall::function(id, call.name, call.args.to_string()));
                } else if let Some(t) = part.text {
                    if part.thought.unwrap_or(false) {
                        reasoning.push_str(&t);
                    } else {
                        text.push_str(&t);
                    }
                }
            }
            let finish = finish_reason_from_gemini(candidate.finish_reason.as_deref(), !calls.is_empty());
            Choice {
                index: candidate.index,
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content: (!text.is_empty() || calls.is_empty()).then_some(MessageContent::Text(text)),
                    tool_calls: (!calls.is_empty()).then_some(calls),
                    reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                    ..ChatMessage::default()
                },
                finish_reason: finish.map(ToString::to_string),
            }
        })
        .collect();

    ChatResponse {
        id: response
            .response_id
            .map_or_else(|| "chatcmpl-gemini".to_string(), |id| format!("chatcmpl-{id}")),
        object: "chat.completion".to_string(),
        created: now_timestamp(),
        model: response.model_version.unwrap_or_else(|| model.to_string()),
        choices,
        usage: Some((&usage).into()),
        extra: Map::new(),
    }
}

/// OpenAI 响应 → generateContent 响应
#[must_use]
pub fn openai_to_gemini_response(response: ChatResponse, usage: &Usage) -> GenerateContentResponse {
    let candidates = response
        .choices
        .into_iter()
        .map(|choice| {
            let message = choice.message;
            let mut parts = Vec::new();
            if let Some(reasoning) = message.reasoning_content.filter(|r| !r.is_empty()) {
                parts.push(Part {
                    text: Some(reasoning),
                    thought: Some(true),
                    ..Part::default()
                });
            }
            let text = message
                .content
                .as_ref()
                .map(MessageContent::joined_text)
                .unwrap_or_default();
            if !text.is_empty() {
                parts.push(Part::text(text));
            }
            for call in message.tool_calls.into_iter().flatten() {
                parts.push(Part {
                    function_call: Some(GeminiCall {
                        name: call.function.name,
                        args: serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({})),
                    }),
                    ..Part::default()
                });
            }
            Candidate {
                index: choice.index,
                content: Content::new("model", parts),
                finish_reason: Some(finish_reason_to_gemini(choice.finish_reason.as_deref()).to_string()),
            }
        })
        .collect();

    GenerateContentResponse {
        candidates,
        usage_metadata: Some(UsageMetadata::from(usage)),
        model_version: Some(response.model),
        response_id: (!response.id.is_empty()).then_some(response.id),
        prompt_feedback: None,
    }
}

/// OpenAI 嵌入请求 → `batchEmbedContents`
pub fn openai_to_gemini_embedding(request: &EmbeddingRequest, model: &str) -> Result<BatchEmbedRequest> {
    let texts = request.input.texts();
    if texts.is_empty() {
        return Err(translation_error!("Gemini 嵌入只支持文本输入"));
    }
    Ok(BatchEmbedRequest {
        requests: texts
            .into_iter()
            .map(|text| EmbedContentRequest {
                model: format!("models/{model}"),
                content: Content {
                    role: None,
                    parts: vec![Part::text(text)],
                },
                output_dimensionality: request.dimensions,
            })
            .collect(),
    })
}

/// `batchEmbedContents` 响应 → OpenAI 嵌入列表
#[must_use]
pub fn gemini_embedding_to_openai(response: BatchEmbedResponse, model: &str, prompt_tokens: u64) -> Value {
    let data: Vec<Value> = response
        .embeddings
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| {
            json!({
                "object": "embedding",
                "index": index,
                "embedding": embedding.values,
            })
        })
        .collect();
    json!({
        "object": "list",
        "data": data,
        "model": model,
        "usage": {"prompt_tokens": prompt_tokens, "total_tokens": prompt_tokens},
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::openai::types::EmbeddingInput;
    use pretty_assertions::assert_eq;
    use reqwest::Client;
    use std::time::Duration;

    fn images() -> ImageFetcher {
        ImageFetcher::new(Client::new(), 1024, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_tool_round_trip_names() {
        let mut assistant = ChatMessage::text("assistant", "");
        assistant.content = None;
        assistant.tool_calls = Some(vec![ToolCall::function("call_9", "get_weather", r#"{"city":"Oslo"}"#)]);
        let request = ChatRequest {
            model: "gemini-2.5-pro".into(),
            messages: vec![
                ChatMessage::text("system", "be brief"),
                ChatMessage::text("user", "weather?"),
                assistant,
                ChatMessage {
                    role: "tool".into(),
                    content: Some(MessageContent::Text("cold".into())),
                    tool_call_id: Some("call_9".into()),
                    ..ChatMessage::default()
                },
            ],
            tool_choice: Some(ToolChoice::Mode("required".into())),
            ..ChatRequest::default()
        };
        let converted = openai_to_gemini_request(request, &images()).await.unwrap();

        assert_eq!(converted.system_instruction.unwrap().text(), "be brief");
        assert_eq!(converted.contents.len(), 3);
        let response = converted.contents[2].parts[0].function_response.as_ref().unwrap();
        assert_eq!(response.name, "get_weather");
        assert_eq!(response.response, json!({"content": "cold"}));
        assert_eq!(
            converted.tool_config.unwrap().function_calling_config.unwrap().mode,
            "ANY"
        );
    }

    #[test]
    fn test_clean_schema_recursive() {
        let mut schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {"inner": {"type": "object", "additionalProperties": true}}
        });
        clean_schema(&mut schema);
        assert_eq!(
            schema,
            json!({"type": "object", "properties": {"inner": {"type": "object"}}})
        );
    }

    #[test]
    fn test_gemini_request_pairs_call_ids() {
        let request: GenerateContentRequest = serde_json::from_value(json!({
            "contents": [
                {"role": "user", "parts": [{"text": "hi"}]},
                {"role": "model", "parts": [{"functionCall": {"name": "f", "args": {"a": 1}}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "f", "response": {"ok": true}}}]}
            ],
            "generationConfig": {"maxOutputTokens": 100, "thinkingConfig": {"thinkingBudget": 2048}}
        }))
        .unwrap();
        let chat = gemini_to_openai_request(request, "gpt-4o");
        let call_id = chat.messages[1].tool_calls.as_ref().unwrap()[0].id.clone();
        assert_eq!(chat.messages[2].tool_call_id.as_deref(), Some(call_id.as_str()));
        assert_eq!(chat.max_tokens, Some(100));
        assert_eq!(chat.reasoning_effort.as_deref(), Some("medium"));
    }

    #[test]
    fn test_finish_reasons() {
        assert_eq!(finish_reason_from_gemini(Some("STOP"), false), Some("stop"));
        assert_eq!(finish_reason_from_gemini(Some("STOP"), true), Some("tool_calls"));
        assert_eq!(finish_reason_from_gemini(Some("MAX_TOKENS"), false), Some("length"));
        assert_eq!(finish_reason_from_gemini(Some("SAFETY"), false), Some("content_filter"));
        assert_eq!(finish_reason_from_gemini(None, false), None);
        assert_eq!(finish_reason_to_gemini(Some("length")), "MAX_TOKENS");
    }

    #[test]
    fn test_response_conversion() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "hmm", "thought": true},
                    {"text": "Hello"}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6},
            "responseId": "r1"
        }))
        .unwrap();
        let openai = gemini_to_openai_response(response, "gemini-2.5-flash");
        assert_eq!(openai.text(), "Hello");
        assert_eq!(openai.choices[0].message.reasoning_content.as_deref(), Some("hmm"));
        assert_eq!(openai.model, "gemini-2.5-flash");

        let usage = Usage::new(4, 2);
        let back = openai_to_gemini_response(openai, &usage);
        assert_eq!(back.candidates[0].content.parts.len(), 2);
        assert_eq!(back.usage_metadata.unwrap().prompt_token_count, 4);
    }

    #[test]
    fn test_embedding_conversion() {
        let request = EmbeddingRequest {
            model: "text-embedding-004".into(),
            input: EmbeddingInput::Many(vec!["a".into(), "b".into()]),
            dimensions: Some(256),
            encoding_format: None,
            extra: Map::new(),
        };
        let batch = openai_to_gemini_embedding(&request, "text-embedding-004").unwrap();
        assert_eq!(batch.requests.len(), 2);
        assert_eq!(batch.requests[0].model, "models/text-embedding-004");
        assert_eq!(batch.requests[1].output_dimensionality, Some(256));

        let value = gemini_embedding_to_openai(
            serde_json::from_value(json!({"embeddings": [{"values": [0.5]}]})).unwrap(),
            "text-embedding-004",
            3,
        );
        assert_eq!(value["data"][0]["embedding"], json!([0.5]));
        assert_eq!(value["usage"]["prompt_tokens"], 3);
    }
}
