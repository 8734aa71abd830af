//! # SSE 编解码
//!
//! 上游流式响应按事件解码；`data` 保留原始文本，由各协议自行解析。

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;
use std::io;
use tokio_util::codec::Decoder;

/// OpenAI 流结束标记
pub const DONE_MARKER: &str = "[DONE]";

/// 一个完整的 SSE 事件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
    pub retry: Option<u64>,
}

impl SseEvent {
    /// 只有 data 的事件
    #[must_use]
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_MARKER
    }

    /// 将 data 解析为 JSON，`[DONE]` 与空 data 返回 `None`
    #[must_use]
    pub fn json(&self) -> Option<Value> {
        let payload = self.data.trim();
        if payload.is_empty() || payload == DONE_MARKER {
            return None;
        }
        serde_json::from_str(payload).ok()
    }

    /// 按 SSE 文本格式重新编码
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut out = String::with_capacity(self.data.len() + 32);
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(retry) = self.retry {
            out.push_str(&format!("retry: {retry}\n"));
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        Bytes::from(out)
    }
}

/// `data: <json>\n\n`
#[must_use]
pub fn data_frame<T: Serialize>(payload: &T) -> Bytes {
    let json = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {json}\n\n"))
}

/// `event: <name>\ndata: <json>\n\n`
#[must_use]
pub fn event_frame<T: Serialize>(event: &str, payload: &T) -> Bytes {
    let json = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("event: {event}\ndata: {json}\n\n"))
}

/// `data: [DONE]\n\n`
#[must_use]
pub fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// 增量 SSE 解码器
#[derive(Debug, Clone, Default)]
pub struct SseDecoder {
    current: SseEvent,
    has_any: bool,
    has_data: bool,
    buffer: String,
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn flush(&mut self) -> Option<SseEvent> {
        if !self.has_any {
            return None;
        }
        let mut event = std::mem::take(&mut self.current);
        event.data = std::mem::take(&mut self.buffer);
        self.has_any = false;
        self.has_data = false;
        Some(event)
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "data" => {
                if self.has_data {
                    self.buffer.push('\n');
                }
                self.buffer.push_str(value);
                self.has_data = true;
                self.has_any = true;
            }
            "event" => {
                self.current.event = Some(value.to_string());
                self.has_any = true;
            }
            "id" => {
                self.current.id = Some(value.to_string());
                self.has_any = true;
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.current.retry = Some(ms);
                }
                self.has_any = true;
            }
            _ => {}
        }
        None
    }

    fn take_one_line(src: &mut BytesMut) -> io::Result<Option<String>> {
        let Some(pos) = src.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let mut line = src.split_to(pos + 1);
        line.truncate(line.len() - 1);
        if line.ends_with(b"\r") {
            line.truncate(line.len() - 1);
        }
        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Decoder for SseDecoder {
    type Item = SseEvent;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        while let Some(line) = Self::take_one_line(src)? {
            if let Some(event) = self.process_line(&line) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        if !src.is_empty() {
            let rest = src.split_to(src.len());
            let line = String::from_utf8(rest.to_vec())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(event) = self.process_line(line) {
                return Ok(Some(event));
            }
        }
        Ok(self.flush())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut codec = SseDecoder::new();
        let mut buf = BytesMut::from(&b"data: {\"a\":1}\n\n"[..]);
        let event = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(event.event, None);
        assert_eq!(event.json().unwrap()["a"], 1);
    }

    #[test]
    fn test_comment_and_multiline_data() {
        let mut codec = SseDecoder::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b": keep-alive\n");
        buf.extend_from_slice(b"data: {\n");
        buf.extend_from_slice(b"data:  \"x\": 42\n");
        buf.extend_from_slice(b"data: }\n\n");
        let event = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(event.json().unwrap()["x"], 42);
    }

    #[test]
    fn test_event_split_across_chunks_with_crlf() {
        let mut codec = SseDecoder::new();
        let mut first = BytesMut::from(&b"event: content_block_delta\r\nid: 9\r\ndata: {\"k\":\"v\"}\r\n"[..]);
        assert!(codec.decode(&mut first).unwrap().is_none());

        let mut second = BytesMut::from(&b"\r\n"[..]);
        let event = codec.decode(&mut second).unwrap().unwrap();
        assert_eq!(event.event.as_deref(), Some("content_block_delta"));
        assert_eq!(event.id.as_deref(), Some("9"));
        assert_eq!(event.json().unwrap()["k"], "v");
    }

    #[test]
    fn test_done_marker() {
        let mut codec = SseDecoder::new();
        let mut buf = BytesMut::from(&b"data: [DONE]\n\n"[..]);
        let event = codec.decode(&mut buf).unwrap().unwrap();
        assert!(event.is_done());
        assert!(event.json().is_none());
    }

    #[test]
    fn test_eof_without_blank_line() {
        let mut codec = SseDecoder::new();
        let mut buf = BytesMut::from(&b"data: {\"tail\":true}"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let event = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(event.json().unwrap()["tail"], true);
    }

    #[test]
    fn test_reencode_matches_wire() {
        let event = SseEvent {
            event: Some("message_stop".into()),
            data: "{\"type\":\"message_stop\"}".into(),
            ..SseEvent::default()
        };
        assert_eq!(
            event.to_bytes(),
            Bytes::from_static(b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n")
        );
    }
}
