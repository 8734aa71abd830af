//! # OpenAI ⇄ Claude 转换

use serde_json::{Map, Value, json};

use super::types::{
    ClaudeContent, ClaudeMessage, ClaudeTool, ClaudeToolChoice, ClaudeUsage, ContentBlock,
    ImageSource, MessagesRequest, MessagesResponse, SystemPrompt, Thinking, ThinkingKind,
    ToolResultContent,
};
use crate::adaptor::image::ImageFetcher;
use crate::adaptor::openai::types::{
    ChatMessage, ChatRequest, ChatResponse, Choice, ContentPart, FunctionDef, FunctionName,
    ImageUrl, MessageContent, NamedToolChoice, StopSequences, StreamOptions, Tool, ToolCall,
    ToolChoice,
};
use crate::adaptor::reasoning::{
    MIN_THINKING_MAX_TOKENS, budget_for_effort, effort_for_budget, thinking_budget,
};
use crate::error::Result;
use crate::translation_error;
use crate::types::{Usage, now_timestamp};

/// 请求未指定输出上限时的默认值
pub const DEFAULT_MAX_TOKENS: u32 = 8192;

/// 占位用户消息
const PLACEHOLDER_USER_TEXT: &str = "...";

/// Claude `stop_reason` → OpenAI `finish_reason`
#[must_use]
pub fn stop_reason_to_finish(reason: Option<&str>) -> &'static str {
    match reason {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        Some("refusal") => "content_filter",
        _ => "stop",
    }
}

/// OpenAI `finish_reason` → Claude `stop_reason`
#[must_use]
pub fn finish_to_stop_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("length") => "max_tokens",
        Some("tool_calls" | "function_call") => "tool_use",
        Some("content_filter") => "refusal",
        _ => "end_turn",
    }
}

/// 追加内容块，同角色时并入上一条消息
fn push_blocks(messages: &mut Vec<ClaudeMessage>, role: &str, blocks: Vec<ContentBlock>) {
    if blocks.is_empty() {
        return;
    }
    if let Some(last) = messages.last_mut().filter(|m| m.role == role) {
        let content = std::mem::replace(&mut last.content, ClaudeContent::Blocks(Vec::new()));
        let mut merged = content.into_blocks();
        merged.extend(blocks);
        last.content = ClaudeContent::Blocks(merged);
        return;
    }
    messages.push(ClaudeMessage::new(role, blocks));
}

async fn convert_parts(content: MessageContent, images: &ImageFetcher) -> Result<Vec<ContentBlock>> {
    let mut blocks = Vec::new();
    for part in content.into_parts() {
        match part {
            ContentPart::Text { text } if !text.is_empty() => blocks.push(ContentBlock::text(text)),
            ContentPart::ImageUrl { image_url } => {
                let image = images.resolve(&image_url.url).await?;
                blocks.push(ContentBlock::Image {
                    source: ImageSource::Base64 {
                        media_type: image.mime_type,
                        data: image.data,
                    },
                });
            }
            _ => {}
        }
    }
    Ok(blocks)
}

fn convert_tool_choice(choice: Option<ToolChoice>, parallel: Option<bool>) -> Option<ClaudeToolChoice> {
    let mut mapped = match choice {
        Some(ToolChoice::Mode(mode)) => ClaudeToolChoice {
            kind: match mode.as_str() {
                "required" | "any" => "any",
                "none" => "none",
                _ => "auto",
            }
            .to_string(),
            name: None,
            disable_parallel_tool_use: None,
        },
        Some(ToolChoice::Named(named)) => ClaudeToolChoice {
            kind: "tool".to_string(),
            name: Some(named.function.name),
            disable_parallel_tool_use: None,
        },
        None if parallel.is_some() => ClaudeToolChoice {
            kind: "auto".to_string(),
            name: None,
            disable_parallel_tool_use: None,
        },
        None => return None,
    };
    if mapped.kind != "none" {
        mapped.disable_parallel_tool_use = parallel.map(|p| !p);
    }
    Some(mapped)
}

/// OpenAI 聊天请求 → Claude Messages 请求
///
/// system/developer 合并为顶层 system；tool 消息转为附加在用户轮次上的 `tool_result`；
/// 同角色相邻消息合并；首条为 assistant 时补一条占位用户消息。
pub async fn openai_to_claude_request(
    request: ChatRequest,
    images: &ImageFetcher,
) -> Result<MessagesRequest> {
    let mut system = Vec::new();
    let mut messages: Vec<ClaudeMessage> = Vec::new();

    let max_tokens = request.output_limit().unwrap_or(DEFAULT_MAX_TOKENS);
    for message in request.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                let text = message.text_content();
                if !text.is_empty() {
                    system.push(ContentBlock::text(text));
                }
            }
            "tool" | "function" => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    content: Some(ToolResultContent::Text(message.text_content())),
                    is_error: None,
                };
                push_blocks(&mut messages, "user", vec![block]);
            }
            "assistant" => {
                let mut blocks = match message.content {
                    Some(content) => convert_parts(content, images).await?,
                    None => Vec::new(),
                };
                for call in message.tool_calls.into_iter().flatten() {
                    let input = serde_json::from_str::<Value>(&call.function.arguments)
                        .ok()
                        .filter(Value::is_object)
                        .unwrap_or_else(|| json!({}));
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id,
                        name: call.function.name,
                        input,
                    });
                }
                push_blocks(&mut messages, "assistant", blocks);
            }
            _ => {
                let blocks = match message.content {
                    Some(content) => convert_parts(content, images).await?,
                    None => Vec::new(),
                };
                push_blocks(&mut messages, "user", blocks);
            }
        }
    }

    if messages.is_empty() {
        return Err(translation_error!("请求中没有可发送给 Claude 的消息"));
    }
    if messages.first().is_some_and(|m| m.role != "user") {
        messages.insert(
            0,
            ClaudeMessage::new("user", vec![ContentBlock::text(PLACEHOLDER_USER_TEXT)]),
        );
    }

    let tools: Option<Vec<ClaudeTool>> = request
        .tools
        .map(|tools| {
            tools
                .into_iter()
                .map(|tool| ClaudeTool {
                    name: tool.function.name,
                    description: tool.function.description,
                    input_schema: tool
                        .function
                        .parameters
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                })
                .collect::<Vec<_>>()
        })
        .filter(|tools| !tools.is_empty());
    let tool_choice = if tools.is_some() {
        convert_tool_choice(request.tool_choice, request.parallel_tool_calls)
    } else {
        None
    };

    Ok(MessagesRequest {
        model: request.model,
        messages,
        system: (!system.is_empty()).then_some(SystemPrompt::Blocks(system)),
        max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences: request.stop.map(StopSequences::into_vec),
        stream: request.stream,
        tools,
        tool_choice,
        thinking: None,
        metadata: request.user.map(|user| json!({ "user_id": user })),
        extra: Map::new(),
    })
}

/// 按思考模式或推理强度设置 `thinking`
///
/// `-thinking` 后缀：temperature 固定为 1、清除 top_p、`max_tokens` 不低于下限，
/// 预算为 `floor(max_tokens × percentage)`。
pub fn apply_thinking(request: &mut MessagesRequest, thinking: bool, effort: Option<&str>, percentage: f64) {
    let budget = if thinking {
        request.max_tokens = request.max_tokens.max(MIN_THINKING_MAX_TOKENS);
        thinking_budget(request.max_tokens, percentage)
    } else if let Some(budget) = effort.and_then(budget_for_effort) {
        if request.max_tokens <= budget {
            request.max_tokens = budget + MIN_THINKING_MAX_TOKENS;
        }
        budget
    } else {
        return;
    };
    request.thinking = Some(Thinking::enabled(budget));
    request.temperature = Some(1.0);
    request.top_p = None;
    request.top_k = None;
}

/// Claude Messages 请求 → OpenAI 聊天请求
#[must_use]
pub fn claude_to_openai_request(request: MessagesRequest) -> ChatRequest {
    let stream = request.is_stream();
    let mut messages = Vec::new();
    if let Some(system) = request.system_text().filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::text("system", system));
    }

    for message in request.messages {
        let blocks = message.content.into_blocks();
        if message.role == "assistant" {
            let mut text = String::new();
            let mut reasoning = String::new();
            let mut calls = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text: t, .. } => text.push_str(&t),
                    ContentBlock::Thinking { thinking, .. } => reasoning.push_str(&thinking),
                    ContentBlock::ToolUse { id, name, input } => {
                        calls.push(ToolCall::function(id, name, input.to_string()));
                    }
                    _ => {}
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
        for block in blocks {
            match block {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(MessageContent::Text(
                        content.map(|c| c.text()).unwrap_or_default(),
                    )),
                    tool_call_id: Some(tool_use_id),
                    ..ChatMessage::default()
                }),
                ContentBlock::Text { text, .. } => parts.push(ContentPart::Text { text }),
                ContentBlock::Image { source } => parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: match source {
                            ImageSource::Base64 { media_type, data } => {
                                format!("data:{media_type};base64,{data}")
                            }
                            ImageSource::Url { url } => url,
                        },
                        detail: None,
                    },
                }),
                _ => {}
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
            role: message.role,
            content: Some(content),
            ..ChatMessage::default()
        });
    }

    let tool_choice = request.tool_choice.as_ref().map(|choice| match choice.kind.as_str() {
        "any" => ToolChoice::Mode("required".to_string()),
        "none" => ToolChoice::Mode("none".to_string()),
        "tool" => ToolChoice::Named(NamedToolChoice {
            kind: "function".to_string(),
            function: FunctionName {
                name: choice.name.clone().unwrap_or_default(),
            },
        }),
        _ => ToolChoice::Mode("auto".to_string()),
    });
    let parallel_tool_calls = request
        .tool_choice
        .as_ref()
        .and_then(|c| c.disable_parallel_tool_use)
        .map(|disabled| !disabled);
    let reasoning_effort = request
        .thinking
        .filter(|t| t.kind == ThinkingKind::Enabled)
        .map(|t| effort_for_budget(t.budget_tokens.unwrap_or(0)).to_string());

    ChatRequest {
        model: request.model,
        messages,
        stream: request.stream,
        stream_options: stream.then_some(StreamOptions {
            include_usage: Some(true),
        }),
        max_tokens: (request.max_tokens > 0).then_some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences.map(StopSequences::Many),
        tools: request.tools.map(|tools| {
            tools
                .into_iter()
                .map(|tool| Tool {
                    kind: "function".to_string(),
                    function: FunctionDef {
                        name: tool.name,
                        description: tool.description,
                        parameters: Some(tool.input_schema),
                    },
                })
                .collect()
        }),
        tool_choice,
        parallel_tool_calls,
        reasoning_effort,
        user: request
            .metadata
            .as_ref()
            .and_then(|m| m.get("user_id"))
            .and_then(Value::as_str)
            .map(ToString::to_string),
        ..ChatRequest::default()
    }
}

/// Claude 响应 → OpenAI 响应
#[must_use]
pub fn claude_to_openai_response(response: MessagesResponse) -> ChatResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut calls = Vec::new();
    for block in response.content {
        match block {
            ContentBlock::Text { text: t, .. } => text.push_str(&t),
            ContentBlock::Thinking { thinking, .. } => reasoning.push_str(&thinking),
            ContentBlock::ToolUse { id, name, input } => {
                calls.push(ToolCall::function(id, name, input.to_string()));
            }
            _ => {}
        }
    }
    let usage = Usage::from(response.usage);

    ChatResponse {
        id: response.id,
        object: "chat.completion".to_string(),
        created: now_timestamp(),
        model: response.model,
        choices: vec![Choice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: (!text.is_empty() || calls.is_empty()).then_some(MessageContent::Text(text)),
                tool_calls: (!calls.is_empty()).then_some(calls),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                ..ChatMessage::default()
            },
            finish_reason: Some(stop_reason_to_finish(response.stop_reason.as_deref()).to_string()),
        }],
        usage: Some((&usage).into()),
        extra: Map::new(),
    }
}

/// OpenAI 响应 → Claude 响应
#[must_use]
pub fn openai_to_claude_response(response: ChatResponse, usage: &Usage) -> MessagesResponse {
    let mut content = Vec::new();
    let mut finish_reason = None;
    if let Some(choice) = response.choices.into_iter().next() {
        finish_reason = choice.finish_reason;
        let message = choice.message;
        if let Some(reasoning) = message.reasoning_content.filter(|r| !r.is_empty()) {
            content.push(ContentBlock::Thinking {
                thinking: reasoning,
                signature: None,
            });
        }
        let text = message
            .content
            .as_ref()
            .map(MessageContent::joined_text)
            .unwrap_or_default();
        if !text.is_empty() {
            content.push(ContentBlock::text(text));
        }
        for call in message.tool_calls.into_iter().flatten() {
            content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input: serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({})),
            });
        }
    }

    MessagesResponse {
        id: response.id,
        kind: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: response.model,
        stop_reason: Some(finish_to_stop_reason(finish_reason.as_deref()).to_string()),
        stop_sequence: None,
        usage: ClaudeUsage::from(usage),
    }
}
