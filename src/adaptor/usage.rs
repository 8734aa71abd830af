//! # 用量估算
//!
//! 上游没有返回用量时，用 cl100k 分词器对文本计数。

use serde_json::Value;
use std::sync::LazyLock;
use tiktoken_rs::CoreBPE;

use super::openai::types::{ChatRequest, ContentPart, MessageContent};
use crate::types::Usage;

/// 每条消息的固定开销
const TOKENS_PER_MESSAGE: u64 = 3;
/// 回复起始的固定开销
const REPLY_PRIMING_TOKENS: u64 = 3;
/// 单张图片按低清晰度计
const TOKENS_PER_IMAGE: u64 = 85;

static CL100K: LazyLock<Option<CoreBPE>> = LazyLock::new(|| tiktoken_rs::cl100k_base().ok());

/// 文本 token 数；分词器不可用时按 4 字符 1 token 估算
#[must_use]
pub fn count_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    match CL100K.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
        None => (text.chars().count() as u64).div_ceil(4),
    }
}

/// 聊天请求的输入 token 估算
#[must_use]
pub fn estimate_chat_prompt(request: &ChatRequest) -> u64 {
    let mut total = REPLY_PRIMING_TOKENS;
    for message in &request.messages {
        total += TOKENS_PER_MESSAGE + count_tokens(&message.role);
        if let Some(name) = &message.name {
            total += count_tokens(name);
        }
        match &message.content {
            Some(MessageContent::Text(text)) => total += count_tokens(text),
            Some(MessageContent::Parts(parts)) => {
                for part in parts {
                    total += match part {
                        ContentPart::Text { text } => count_tokens(text),
                        ContentPart::ImageUrl { .. } => TOKENS_PER_IMAGE,
                        ContentPart::InputAudio { .. } | ContentPart::File { .. } => 0,
                    };
                }
            }
            None => {}
        }
        for call in message.tool_calls.iter().flatten() {
            total += count_tokens(&call.function.name) + count_tokens(&call.function.arguments);
        }
    }
    for tool in request.tools.iter().flatten() {
        total += count_tokens(&tool.function.name);
        if let Some(description) = &tool.function.description {
            total += count_tokens(description);
        }
        if let Some(parameters) = &tool.function.parameters {
            total += count_tokens(&parameters.to_string());
        }
    }
    total
}

/// 多段纯文本输入的估算
#[must_use]
pub fn estimate_texts<'a>(texts: impl IntoIterator<Item = &'a str>) -> u64 {
    texts.into_iter().map(count_tokens).sum()
}

/// 以准入时的输入估算与收集到的输出文本构造用量
#[must_use]
pub fn estimate_usage(prompt_tokens: u64, completion_text: &str) -> Usage {
    Usage::new(prompt_tokens, count_tokens(completion_text))
}

/// 从任意 OpenAI 风格响应中提取 `usage`，兼容 `input_tokens/output_tokens` 命名
#[must_use]
pub fn extract_usage(value: &Value) -> Option<Usage> {
    let usage = value
        .get("usage")
        .filter(|u| u.is_object())
        .or_else(|| value.get("response")?.get("usage").filter(|u| u.is_object()))?;
    let number = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| usage.get(*k).and_then(Value::as_u64))
            .unwrap_or(0)
    };
    let detail = |keys: &[&str], field: &str| {
        keys.iter()
            .find_map(|k| usage.get(*k)?.get(field)?.as_u64())
            .unwrap_or(0)
    };

    let mut parsed = Usage::new(
        number(&["prompt_tokens", "input_tokens"]),
        number(&["completion_tokens", "output_tokens"]),
    );
    parsed.total_tokens = parsed.total_tokens.max(number(&["total_tokens"]));
    parsed.cached_tokens = detail(&["prompt_tokens_details", "input_tokens_details"], "cached_tokens");
    parsed.reasoning_tokens = detail(
        &["completion_tokens_details", "output_tokens_details"],
        "reasoning_tokens",
    );
    (!parsed.is_empty()).then_some(parsed)
}
