//! # OpenAI 流式编解码

use bytes::Bytes;
use serde_json::Value;

use super::types::ChatChunk;
use crate::adaptor::parse_upstream_error;
use crate::adaptor::sse::{SseEvent, data_frame, done_frame};
use crate::adaptor::stream::{StreamDecoder, StreamEncoder};
use crate::error::Result;
use crate::types::Usage;

/// 解析 `chat.completion.chunk`
#[derive(Debug, Default)]
pub struct OpenAiStreamDecoder;

impl StreamDecoder for OpenAiStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<ChatChunk>> {
        let Some(value) = event.json() else {
            return Ok(Vec::new());
        };
        if value.get("error").is_some_and(|e| !e.is_null()) {
            return Err(parse_upstream_error(500, event.data.as_bytes()));
        }
        // 兼容服务商偶尔插入的非分片事件
        if value.get("choices").is_none() && value.get("usage").is_none() {
            return Ok(Vec::new());
        }
        let chunk: ChatChunk = serde_json::from_value::<ChatChunk>(value.clone())
            .or_else(|_| serde_json::from_value::<ChatChunk>(strip_nulls(value)))?;
        Ok(vec![chunk])
    }
}

fn strip_nulls(mut value: Value) -> Value {
    if let Some(obj) = value.as_object_mut() {
        obj.retain(|_, v| !v.is_null());
    }
    value
}

/// 输出 OpenAI SSE；末尾用量块仅在客户端要求时输出
#[derive(Debug)]
pub struct OpenAiStreamEncoder {
    include_usage: bool,
    id: String,
    model: String,
    created: i64,
}

impl OpenAiStreamEncoder {
    #[must_use]
    pub fn new(include_usage: bool) -> Self {
        Self {
            include_usage,
            id: String::new(),
            model: String::new(),
            created: 0,
        }
    }
}

impl StreamEncoder for OpenAiStreamEncoder {
    fn encode(&mut self, chunk: &ChatChunk) -> Vec<Bytes> {
        if self.id.is_empty() {
            self.id.clone_from(&chunk.id);
            self.model.clone_from(&chunk.model);
            self.created = chunk.created;
        }
        if chunk.choices.is_empty() {
            return Vec::new();
        }
        let mut chunk = chunk.clone();
        chunk.usage = None;
        vec![data_frame(&chunk)]
    }

    fn finish(&mut self, usage: &Usage) -> Vec<Bytes> {
        let mut frames = Vec::with_capacity(2);
        if self.include_usage {
            let mut chunk = ChatChunk::new(self.id.clone(), self.model.clone(), self.created);
            chunk.usage = Some(usage.into());
            frames.push(data_frame(&chunk));
        }
        frames.push(done_frame());
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::openai::types::Delta;
    use crate::error::RelayError;

    #[test]
    fn test_decode_chunk_and_done() {
        let mut decoder = OpenAiStreamDecoder;
        let event = SseEvent::data(
            r#"{"id":"c1","object":"chat.completion.chunk","created":1,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#,
        );
        let chunks = decoder.decode(&event).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text_fragments().collect::<String>(), "Hi");
        assert!(decoder.decode(&SseEvent::data("[DONE]")).unwrap().is_empty());
    }

    #[test]
    fn test_decode_error_event() {
        let mut decoder = OpenAiStreamDecoder;
        let err = decoder
            .decode(&SseEvent::data(r#"{"error":{"message":"overloaded","type":"server_error"}}"#))
            .unwrap_err();
        assert!(matches!(err, RelayError::Upstream { .. }));
    }

    #[test]
    fn test_usage_chunk_only_when_requested() {
        let chunk = ChatChunk::new("c1", "gpt-4o", 1).with_delta(Delta::content("x"), None);
        let usage = Usage::new(3, 1);

        let mut with_usage = OpenAiStreamEncoder::new(true);
        with_usage.encode(&chunk);
        let frames = with_usage.finish(&usage);
        assert_eq!(frames.len(), 2);
        assert!(String::from_utf8_lossy(&frames[0]).contains("\"prompt_tokens\":3"));

        let mut without = OpenAiStreamEncoder::new(false);
        without.encode(&chunk);
        let frames = without.finish(&usage);
        assert_eq!(frames, vec![done_frame()]);
    }
}
