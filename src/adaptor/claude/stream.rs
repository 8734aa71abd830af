//! # Claude 流式编解码
//!
//! 解码：Claude 事件序列 → OpenAI 分片。编码：OpenAI 分片 → Claude 事件序列，
//! 同一时刻只有一个打开的内容块，新块开始前先关闭上一个。

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};

use super::convert::{finish_to_stop_reason, stop_reason_to_finish};
use super::types::{ClaudeUsage, ContentBlock, MessagesResponse};
use crate::adaptor::openai::types::{ChatChunk, Delta, FunctionDelta, ToolCallDelta};
use crate::adaptor::parse_upstream_error;
use crate::adaptor::sse::{SseEvent, event_frame};
use crate::adaptor::stream::{StreamDecoder, StreamEncoder};
use crate::error::Result;
use crate::types::{Usage, now_timestamp};

/// Claude 流事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: MessagesResponse,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<ClaudeUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: StreamError,
    },
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MessageStart { .. } => "message_start",
            Self::ContentBlockStart { .. } => "content_block_start",
            Self::ContentBlockDelta { .. } => "content_block_delta",
            Self::ContentBlockStop { .. } => "content_block_stop",
            Self::MessageDelta { .. } => "message_delta",
            Self::MessageStop => "message_stop",
            Self::Ping => "ping",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }

    fn frame(&self) -> Bytes {
        event_frame(self.name(), self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StreamError {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

impl StreamError {
    fn status(&self) -> u16 {
        match self.kind.as_str() {
            "overloaded_error" => 529,
            "rate_limit_error" => 429,
            "invalid_request_error" => 400,
            _ => 500,
        }
    }
}

/// Claude 事件 → OpenAI 分片
#[derive(Debug)]
pub struct ClaudeStreamDecoder {
    id: String,
    model: String,
    created: i64,
    /// Claude 块序号 → OpenAI 工具调用序号
    tool_indexes: HashMap<u32, u32>,
    usage: ClaudeUsage,
    refusal: bool,
}

impl ClaudeStreamDecoder {
    #[must_use]
    pub fn new(model: &str) -> Self {
        Self {
            id: String::new(),
            model: model.to_string(),
            created: now_timestamp(),
            tool_indexes: HashMap::new(),
            usage: ClaudeUsage::default(),
            refusal: false,
        }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>) -> ChatChunk {
        ChatChunk::new(self.id.clone(), self.model.clone(), self.created).with_delta(delta, finish_reason)
    }

    fn merge_usage(&mut self, usage: ClaudeUsage) {
        if usage.input_tokens > 0 {
            self.usage.input_tokens = usage.input_tokens;
        }
        if usage.output_tokens > 0 {
            self.usage.output_tokens = usage.output_tokens;
        }
        if usage.cache_read_input_tokens > 0 {
            self.usage.cache_read_input_tokens = usage.cache_read_input_tokens;
        }
        if usage.cache_creation_input_tokens > 0 {
            self.usage.cache_creation_input_tokens = usage.cache_creation_input_tokens;
        }
    }

    fn tool_delta(index: u32, id: Option<String>, name: Option<String>, arguments: String) -> Delta {
        Delta {
            tool_calls: Some(vec![ToolCallDelta {
                index,
                kind: id.as_ref().map(|_| "function".to_string()),
                id,
                function: Some(FunctionDelta {
                    name,
                    arguments: Some(arguments),
                }),
            }]),
            ..Delta::default()
        }
    }
}

impl StreamDecoder for ClaudeStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<ChatChunk>> {
        let Ok(parsed) = serde_json::from_str::<StreamEvent>(event.data.trim()) else {
            return Ok(Vec::new());
        };
        let chunks = match parsed {
            StreamEvent::MessageStart { message } => {
                if !message.id.is_empty() {
                    self.id = message.id;
                }
                if !message.model.is_empty() {
                    self.model = message.model;
                }
                self.merge_usage(message.usage);
                let mut chunk = self.chunk(Delta::role("assistant"), None);
                chunk.usage = Some((&Usage::from(self.usage)).into());
                vec![chunk]
            }
            StreamEvent::ContentBlockStart { index, content_block } => match content_block {
                ContentBlock::ToolUse { id, name, .. } => {
                    let tool_index = self.tool_indexes.len() as u32;
                    self.tool_indexes.insert(index, tool_index);
                    vec![self.chunk(Self::tool_delta(tool_index, Some(id), Some(name), String::new()), None)]
                }
                ContentBlock::Text { text, .. } if !text.is_empty() => {
                    vec![self.chunk(Delta::content(text), None)]
                }
                _ => Vec::new(),
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => vec![self.chunk(Delta::content(text), None)],
                BlockDelta::ThinkingDelta { thinking } => vec![self.chunk(
                    Delta {
                        reasoning_content: Some(thinking),
                        ..Delta::default()
                    },
                    None,
                )],
                BlockDelta::InputJsonDelta { partial_json } => {
                    match self.tool_indexes.get(&index).copied() {
                        Some(tool_index) => {
                            vec![self.chunk(Self::tool_delta(tool_index, None, None, partial_json), None)]
                        }
                        None => Vec::new(),
                    }
                }
                BlockDelta::SignatureDelta { .. } | BlockDelta::Unknown => Vec::new(),
            },
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.merge_usage(usage);
                }
                let reason = delta.stop_reason.as_deref();
                if reason == Some("refusal") {
                    self.refusal = true;
                }
                let mut chunk = self.chunk(Delta::default(), Some(stop_reason_to_finish(reason).to_string()));
                chunk.usage = Some((&Usage::from(self.usage)).into());
                vec![chunk]
            }
            StreamEvent::Error { error } => {
                return Err(parse_upstream_error(error.status(), event.data.as_bytes()));
            }
            StreamEvent::ContentBlockStop { .. }
            | StreamEvent::MessageStop
            | StreamEvent::Ping
            | StreamEvent::Unknown => Vec::new(),
        };
        Ok(chunks)
    }

    fn refusal(&self) -> bool {
        self.refusal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Thinking,
    Text,
    Tool(u32),
}

#[derive(Debug, Default)]
struct PendingTool {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
    block: Option<u32>,
}

/// OpenAI 分片 → Claude 事件
#[derive(Debug)]
pub struct ClaudeStreamEncoder {
    id: String,
    model: String,
    started: bool,
    next_block: u32,
    current: Option<(OpenBlock, u32)>,
    tools: BTreeMap<u32, PendingTool>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl ClaudeStreamEncoder {
    #[must_use]
    pub fn new(request_id: &str, model: &str) -> Self {
        Self {
            id: format!("msg_{request_id}"),
            model: model.to_string(),
            started: false,
            next_block: 0,
            current: None,
            tools: BTreeMap::new(),
            finish_reason: None,
            usage: None,
        }
    }

    fn ensure_message_start(&mut self, out: &mut Vec<Bytes>) {
        if self.started {
            return;
        }
        self.started = true;
        let message = MessagesResponse {
            id: self.id.clone(),
            kind: "message".to_string(),
            role: "assistant".to_string(),
            model: self.model.clone(),
            usage: self.usage.as_ref().map(ClaudeUsage::from).unwrap_or_default(),
            ..MessagesResponse::default()
        };
        out.push(StreamEvent::MessageStart { message }.frame());
    }

    fn close_current(&mut self, out: &mut Vec<Bytes>) {
        if let Some((_, index)) = self.current.take() {
            out.push(StreamEvent::ContentBlockStop { index }.frame());
        }
    }

    /// 切换到指定类型的块，返回块序号
    fn open(&mut self, kind: OpenBlock, block: ContentBlock, out: &mut Vec<Bytes>) -> u32 {
        if let Some((current, index)) = self.current {
            if current == kind {
                return index;
            }
        }
        self.ensure_message_start(out);
        self.close_current(out);
        let index = self.next_block;
        self.next_block += 1;
        self.current = Some((kind, index));
        out.push(
            StreamEvent::ContentBlockStart {
                index,
                content_block: block,
            }
            .frame(),
        );
        index
    }

    fn push_delta(out: &mut Vec<Bytes>, index: u32, delta: BlockDelta) {
        out.push(StreamEvent::ContentBlockDelta { index, delta }.frame());
    }

    fn handle_tool(&mut self, call: &ToolCallDelta, out: &mut Vec<Bytes>) {
        let entry = self.tools.entry(call.index).or_default();
        if let Some(id) = call.id.as_deref().filter(|s| !s.is_empty()) {
            entry.id = Some(id.to_string());
        }
        if let Some(function) = &call.function {
            if let Some(name) = function.name.as_deref().filter(|s| !s.is_empty()) {
                entry.name = Some(name.to_string());
            }
            if let Some(args) = function.arguments.as_deref() {
                entry.arguments.push_str(args);
            }
        }

        if let Some(block) = entry.block {
            let args = std::mem::take(&mut entry.arguments);
            if !args.is_empty() {
                Self::push_delta(out, block, BlockDelta::InputJsonDelta { partial_json: args });
            }
            return;
        }
        let (Some(id), Some(name)) = (entry.id.clone(), entry.name.clone()) else {
            return;
        };
        let args = std::mem::take(&mut entry.arguments);
        let block = self.open(
            OpenBlock::Tool(call.index),
            ContentBlock::ToolUse {
                id,
                name,
                input: json!({}),
            },
            out,
        );
        if let Some(entry) = self.tools.get_mut(&call.index) {
            entry.block = Some(block);
        }
        if !args.is_empty() {
            Self::push_delta(out, block, BlockDelta::InputJsonDelta { partial_json: args });
        }
    }
}

impl StreamEncoder for ClaudeStreamEncoder {
    fn encode(&mut self, chunk: &ChatChunk) -> Vec<Bytes> {
        let mut out = Vec::new();
        if let Some(usage) = chunk.usage {
            self.usage = Some(Usage::from(usage));
        }
        let Some(choice) = chunk.choices.first() else {
            return out;
        };
        self.ensure_message_start(&mut out);

        let delta = &choice.delta;
        if let Some(thinking) = delta.reasoning_content.as_deref().filter(|s| !s.is_empty()) {
            let index = self.open(
                OpenBlock::Thinking,
                ContentBlock::Thinking {
                    thinking: String::new(),
                    signature: None,
                },
                &mut out,
            );
            Self::push_delta(
                &mut out,
                index,
                BlockDelta::ThinkingDelta {
                    thinking: thinking.to_string(),
                },
            );
        }
        if let Some(text) = delta.content.as_deref().filter(|s| !s.is_empty()) {
            let index = self.open(OpenBlock::Text, ContentBlock::text(""), &mut out);
            Self::push_delta(&mut out, index, BlockDelta::TextDelta { text: text.to_string() });
        }
        for call in delta.tool_calls.iter().flatten() {
            self.handle_tool(call, &mut out);
        }
        if let Some(reason) = choice.finish_reason.as_deref().filter(|s| !s.is_empty()) {
            self.finish_reason = Some(reason.to_string());
        }
        out
    }

    fn finish(&mut self, usage: &Usage) -> Vec<Bytes> {
        let mut out = Vec::new();
        self.ensure_message_start(&mut out);
        self.close_current(&mut out);
        out.push(
            StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some(finish_to_stop_reason(self.finish_reason.as_deref()).to_string()),
                    stop_sequence: None,
                },
                usage: Some(ClaudeUsage::from(usage)),
            }
            .frame(),
        );
        out.push(StreamEvent::MessageStop.frame());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn events(lines: &[&str]) -> Vec<SseEvent> {
        lines.iter().map(|l| SseEvent::data(*l)).collect()
    }

    fn event_names(frames: &[Bytes]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| {
                let text = String::from_utf8_lossy(f);
                text.lines()
                    .next()
                    .and_then(|l| l.strip_prefix("event: "))
                    .map(ToString::to_string)
            })
            .collect()
    }

    #[test]
    fn test_decode_text_and_tool_use() {
        let mut decoder = ClaudeStreamDecoder::new("claude-sonnet-4");
        let input = events(&[
            r#"{"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","content":[],"model":"claude-sonnet-4","usage":{"input_tokens":12,"output_tokens":1}}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Checking"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"search","input":{}}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"q\":"}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"rust\"}"}}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
            r#"{"type":"message_stop"}"#,
        ]);
        let chunks: Vec<ChatChunk> = input
            .iter()
            .flat_map(|e| decoder.decode(e).unwrap())
            .collect();

        let text: String = chunks.iter().flat_map(|c| c.choices.iter()).filter_map(|c| c.delta.content.clone()).collect();
        assert_eq!(text, "Checking");

        let args: String = chunks
            .iter()
            .flat_map(|c| c.choices.iter())
            .flat_map(|c| c.delta.tool_calls.iter().flatten())
            .filter_map(|t| t.function.as_ref()?.arguments.clone())
            .collect();
        assert_eq!(args, r#"{"q":"rust"}"#);

        let last = chunks.last().unwrap();
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        let usage = Usage::from(last.usage.unwrap());
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 9);
        assert!(!decoder.refusal());
    }

    #[test]
    fn test_decode_refusal_and_error() {
        let mut decoder = ClaudeStreamDecoder::new("claude-sonnet-4");
        let chunks = decoder
            .decode(&SseEvent::data(r#"{"type":"message_delta","delta":{"stop_reason":"refusal"}}"#))
            .unwrap();
        assert_eq!(chunks[0].choices[0].finish_reason.as_deref(), Some("content_filter"));
        assert!(decoder.refusal());

        let err = decoder
            .decode(&SseEvent::data(
                r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            ))
            .unwrap_err();
        assert_eq!(err.status_code(), 529);
    }

    #[test]
    fn test_encoder_closes_blocks_in_order() {
        let mut encoder = ClaudeStreamEncoder::new("req1", "claude-sonnet-4");
        let mut frames = Vec::new();
        frames.extend(encoder.encode(&ChatChunk::new("c", "m", 1).with_delta(Delta::content("Hi"), None)));
        frames.extend(encoder.encode(&ChatChunk::new("c", "m", 1).with_delta(
            Delta {
                tool_calls: Some(vec![ToolCallDelta {
                    index: 0,
                    id: Some("call_1".into()),
                    kind: Some("function".into()),
                    function: Some(FunctionDelta {
                        name: Some("search".into()),
                        arguments: Some("{\"q\":1}".into()),
                    }),
                }]),
                ..Delta::default()
            },
            Some("tool_calls".into()),
        )));
        frames.extend(encoder.finish(&Usage::new(5, 3)));

        assert_eq!(
            event_names(&frames),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        let delta = String::from_utf8_lossy(&frames[7]).to_string();
        assert!(delta.contains("\"stop_reason\":\"tool_use\""));
        assert!(delta.contains("\"output_tokens\":3"));
        assert!(String::from_utf8_lossy(&frames[4]).contains("\"index\":1"));
    }

    #[test]
    fn test_tool_args_wait_for_name() {
        let mut encoder = ClaudeStreamEncoder::new("req1", "m");
        let partial = ChatChunk::new("c", "m", 1).with_delta(
            Delta {
                tool_calls: Some(vec![ToolCallDelta {
                    index: 0,
                    id: Some("call_1".into()),
                    function: Some(FunctionDelta {
                        name: None,
                        arguments: Some("{".into()),
                    }),
                    ..ToolCallDelta::default()
                }]),
                ..Delta::default()
            },
            None,
        );
        assert_eq!(event_names(&encoder.encode(&partial)), vec!["message_start"]);
    }
}
