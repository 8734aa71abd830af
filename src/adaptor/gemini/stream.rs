//! # Gemini 流式编解码
//!
//! `streamGenerateContent?alt=sse` 的每个事件都是一个完整的 `GenerateContentResponse`。

use bytes::Bytes;
use serde_json::{Value, json};
use std::collections::BTreeMap;

use super::convert::{finish_reason_from_gemini, finish_reason_to_gemini};
use super::types::{Candidate, Content, FunctionCall as GeminiCall, GenerateContentResponse, Part, UsageMetadata};
use crate::adaptor::openai::types::{ChatChunk, Delta, FunctionDelta, ToolCallDelta};
use crate::adaptor::parse_upstream_error;
use crate::adaptor::sse::{SseEvent, data_frame};
use crate::adaptor::stream::{StreamDecoder, StreamEncoder};
use crate::error::Result;
use crate::types::{Usage, now_timestamp};

/// Gemini 响应片段 → OpenAI 分片
#[derive(Debug)]
pub struct GeminiStreamDecoder {
    id: String,
    model: String,
    created: i64,
    tool_calls: u32,
    role_sent: bool,
}

impl GeminiStreamDecoder {
    #[must_use]
    pub fn new(request_id: &str, model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{request_id}"),
            model: model.to_string(),
            created: now_timestamp(),
            tool_calls: 0,
            role_sent: false,
        }
    }
}

impl StreamDecoder for GeminiStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<ChatChunk>> {
        let Some(value) = event.json() else {
            return Ok(Vec::new());
        };
        if value.get("error").is_some_and(|e| !e.is_null()) {
            let status = value
                .pointer("/error/code")
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok())
                .unwrap_or(500);
            return Err(parse_upstream_error(status, event.data.as_bytes()));
        }
        let Ok(response) = serde_json::from_value::<GenerateContentResponse>(value) else {
            return Ok(Vec::new());
        };

        let mut delta = Delta::default();
        if !self.role_sent {
            self.role_sent = true;
            delta.role = Some("assistant".to_string());
        }
        let mut finish_reason = None;
        if let Some(candidate) = response.candidates.into_iter().next() {
            let mut text = String::new();
            let mut reasoning = String::new();
            let mut calls = Vec::new();
            for part in candidate.content.parts {
                if let Some(call) = part.function_call {
                    calls.push(ToolCallDelta {
                        index: self.tool_calls,
                        id: Some(format!("call_{}", self.tool_calls + 1)),
                        kind: Some("function".to_string()),
                        function: Some(FunctionDelta {
                            name: Some(call.name),
                            arguments: Some(call.args.to_string()),
                        }),
                    });
                    self.tool_calls += 1;
                } else if let Some(t) = part.text {
                    if part.thought.unwrap_or(false) {
                        reasoning.push_str(&t);
                    } else {
                        text.push_str(&t);
                    }
                }
            }
            delta.content = (!text.is_empty()).then_some(text);
            delta.reasoning_content = (!reasoning.is_empty()).then_some(reasoning);
            delta.tool_calls = (!calls.is_empty()).then_some(calls);
            finish_reason = finish_reason_from_gemini(candidate.finish_reason.as_deref(), self.tool_calls > 0);
        } else if response
            .prompt_feedback
            .as_ref()
            .is_some_and(|f| f.get("blockReason").is_some())
        {
            finish_reason = Some("content_filter");
        }

        let mut chunk = ChatChunk::new(self.id.clone(), self.model.clone(), self.created)
            .with_delta(delta, finish_reason.map(ToString::to_string));
        if let Some(usage) = response.usage_metadata {
            chunk.usage = Some((&Usage::from(usage)).into());
        }
        Ok(vec![chunk])
    }
}

#[derive(Debug, Default)]
struct PendingCall {
    name: String,
    arguments: String,
}

/// OpenAI 分片 → Gemini 响应片段
///
/// 文本逐片输出；函数调用参数累积到结束时整体输出。
#[derive(Debug)]
pub struct GeminiStreamEncoder {
    model: String,
    calls: BTreeMap<u32, PendingCall>,
    finish_reason: Option<String>,
}

impl GeminiStreamEncoder {
    #[must_use]
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            calls: BTreeMap::new(),
            finish_reason: None,
        }
    }

    fn frame(&self, parts: Vec<Part>, finish_reason: Option<String>, usage: Option<UsageMetadata>) -> Bytes {
        let response = GenerateContentResponse {
            candidates: vec![Candidate {
                index: 0,
                content: Content::new("model", parts),
                finish_reason,
            }],
            usage_metadata: usage,
            model_version: Some(self.model.clone()),
            response_id: None,
            prompt_feedback: None,
        };
        data_frame(&response)
    }
}

impl StreamEncoder for GeminiStreamEncoder {
    fn encode(&mut self, chunk: &ChatChunk) -> Vec<Bytes> {
        let Some(choice) = chunk.choices.first() else {
            return Vec::new();
        };
        let delta = &choice.delta;
        for call in delta.tool_calls.iter().flatten() {
            let entry = self.calls.entry(call.index).or_default();
            if let Some(function) = &call.function {
                if let Some(name) = function.name.as_deref().filter(|n| !n.is_empty()) {
                    entry.name = name.to_string();
                }
                if let Some(args) = function.arguments.as_deref() {
                    entry.arguments.push_str(args);
                }
            }
        }
        if let Some(reason) = choice.finish_reason.as_deref().filter(|r| !r.is_empty()) {
            self.finish_reason = Some(reason.to_string());
        }

        let mut parts = Vec::new();
        if let Some(reasoning) = delta.reasoning_content.as_deref().filter(|r| !r.is_empty()) {
            parts.push(Part {
                text: Some(reasoning.to_string()),
                thought: Some(true),
                ..Part::default()
            });
        }
        if let Some(text) = delta.content.as_deref().filter(|t| !t.is_empty()) {
            parts.push(Part::text(text));
        }
        if parts.is_empty() {
            return Vec::new();
        }
        vec![self.frame(parts, None, None)]
    }

    fn finish(&mut self, usage: &Usage) -> Vec<Bytes> {
        let parts = std::mem::take(&mut self.calls)
            .into_values()
            .filter(|call| !call.name.is_empty())
            .map(|call| Part {
                function_call: Some(GeminiCall {
                    name: call.name,
                    args: serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({})),
                }),
                ..Part::default()
            })
            .collect();
        let reason = finish_reason_to_gemini(self.finish_reason.as_deref()).to_string();
        vec![self.frame(parts, Some(reason), Some(UsageMetadata::from(usage)))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_text_thought_and_call() {
        let mut decoder = GeminiStreamDecoder::new("req", "gemini-2.5-pro");
        let first = decoder
            .decode(&SseEvent::data(
                r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"plan","thought":true},{"text":"Hi"}]}}]}"#,
            ))
            .unwrap();
        let delta = &first[0].choices[0].delta;
        assert_eq!(delta.role.as_deref(), Some("assistant"));
        assert_eq!(delta.content.as_deref(), Some("Hi"));
        assert_eq!(delta.reasoning_content.as_deref(), Some("plan"));

        let last = decoder
            .decode(&SseEvent::data(
                r#"{"candidates":[{"content":{"role":"model","parts":[{"functionCall":{"name":"f","args":{"x":1}}}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":7,"candidatesTokenCount":3,"totalTokenCount":10}}"#,
            ))
            .unwrap();
        let choice = &last[0].choices[0];
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        let call = &choice.delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.function.as_ref().unwrap().arguments.as_deref(), Some(r#"{"x":1}"#));
        assert_eq!(Usage::from(last[0].usage.unwrap()).prompt_tokens, 7);
    }

    #[test]
    fn test_decode_error_status() {
        let mut decoder = GeminiStreamDecoder::new("req", "gemini-2.5-pro");
        let err = decoder
            .decode(&SseEvent::data(
                r#"{"error":{"code":429,"message":"quota","status":"RESOURCE_EXHAUSTED"}}"#,
            ))
            .unwrap_err();
        assert_eq!(err.status_code(), 429);
    }

    #[test]
    fn test_encoder_emits_calls_at_finish() {
        let mut encoder = GeminiStreamEncoder::new("gemini-2.5-pro");
        let text = encoder.encode(&ChatChunk::new("c", "m", 1).with_delta(Delta::content("Hi"), None));
        assert_eq!(text.len(), 1);

        let call_chunk = ChatChunk::new("c", "m", 1).with_delta(
            Delta {
                tool_calls: Some(vec![ToolCallDelta {
                    index: 0,
                    id: Some("call_1".into()),
                    kind: Some("function".into()),
                    function: Some(FunctionDelta {
                        name: Some("lookup".into()),
                        arguments: Some("{\"q\":".into()),
                    }),
                }]),
                ..Delta::default()
            },
            None,
        );
        assert!(encoder.encode(&call_chunk).is_empty());
        let more = ChatChunk::new("c", "m", 1).with_delta(
            Delta {
                tool_calls: Some(vec![ToolCallDelta {
                    index: 0,
                    function: Some(FunctionDelta {
                        name: None,
                        arguments: Some("\"a\"}".into()),
                    }),
                    ..ToolCallDelta::default()
                }]),
                ..Delta::default()
            },
            Some("tool_calls".into()),
        );
        assert!(encoder.encode(&more).is_empty());

        let frames = encoder.finish(&Usage::new(5, 2));
        let body = String::from_utf8_lossy(&frames[0]).to_string();
        let json: Value = serde_json::from_str(body.trim().trim_start_matches("data: ")).unwrap();
        assert_eq!(json["candidates"][0]["content"]["parts"][0]["functionCall"]["args"], json!({"q": "a"}));
        assert_eq!(json["candidates"][0]["finishReason"], "STOP");
        assert_eq!(json["usageMetadata"]["promptTokenCount"], 5);
    }
}
