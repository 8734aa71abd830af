//! # 最近调用环
//!
//! 固定容量的审计环，记录最近若干次请求的脱敏请求头、截断后的请求体、
//! 上游状态与响应体（流式响应按分块记录并聚合文本）。每个槽位独立加锁。

use axum::http::HeaderMap;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::RecentCallsConfig;
use crate::types::now_timestamp;

/// 需要脱敏的请求头
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "x-goog-api-key",
    "api-key",
    "cookie",
    "set-cookie",
];

/// 记录下来的请求或响应体
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedBody {
    /// `json` / `text` / `binary`
    pub kind: &'static str,
    pub content: String,
    pub size: usize,
    pub truncated: bool,
}

impl RecordedBody {
    fn capture(bytes: &[u8], content_type: Option<&str>, max_bytes: usize) -> Self {
        let truncated = bytes.len() > max_bytes;
        let head = &bytes[..bytes.len().min(max_bytes)];
        let is_json = content_type.is_some_and(|c| c.contains("json"));
        match std::str::from_utf8(head) {
            Ok(text) if !is_binary_type(content_type) => Self {
                kind: if is_json { "json" } else { "text" },
                content: text.to_string(),
                size: bytes.len(),
                truncated,
            },
            _ => Self {
                kind: "binary",
                content: BASE64.encode(head),
                size: bytes.len(),
                truncated,
            },
        }
    }
}

fn is_binary_type(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|c| {
        c.starts_with("audio/")
            || c.starts_with("image/")
            || c.starts_with("video/")
            || c.starts_with("application/octet-stream")
            || c.starts_with("multipart/")
    })
}

/// 一次调用的审计记录
#[derive(Debug, Clone, Serialize)]
pub struct RecentCall {
    pub id: u64,
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub created_at: i64,
    pub request_headers: BTreeMap<String, String>,
    pub request_body: Option<RecordedBody>,
    pub status: Option<u16>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Option<RecordedBody>,
    pub stream_chunks: Vec<String>,
    pub stream_text: String,
    pub stream_truncated: bool,
    pub error: Option<String>,
    #[serde(skip)]
    is_stream: bool,
    #[serde(skip)]
    response_buffer: Vec<u8>,
    #[serde(skip)]
    response_type: Option<String>,
}

/// 调用开始时的请求信息
#[derive(Debug, Clone, Copy)]
pub struct CallStart<'a> {
    pub request_id: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

/// 掩码：保留首尾各 4 个字符
#[must_use]
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 12 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}****{tail}")
}

/// 请求头转为有序映射并脱敏
#[must_use]
pub fn masked_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let raw = String::from_utf8_lossy(value.as_bytes()).to_string();
            let value = if SENSITIVE_HEADERS.contains(&name.as_str()) {
                match raw.split_once(' ') {
                    Some((scheme, secret)) => format!("{scheme} {}", mask_secret(secret)),
                    None => mask_secret(&raw),
                }
            } else {
                raw
            };
            (name.as_str().to_string(), value)
        })
        .collect()
}

/// 从一段 SSE 文本中提取三种协议的输出文本
fn sse_text(chunk: &str) -> String {
    let mut text = String::new();
    for line in chunk.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(data.trim()) else {
            continue;
        };
        for pointer in ["/choices/0/delta/content", "/delta/text", "/candidates/0/content/parts/0/text", "/delta"] {
            if let Some(fragment) = value.pointer(pointer).and_then(Value::as_str) {
                text.push_str(fragment);
                break;
            }
        }
    }
    text
}

/// 最近调用环
#[derive(Debug)]
pub struct RecentCalls {
    slots: Vec<Mutex<Option<RecentCall>>>,
    next_id: AtomicU64,
    config: RecentCallsConfig,
}

impl RecentCalls {
    #[must_use]
    pub fn new(config: RecentCallsConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            next_id: AtomicU64::new(0),
            config,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, id: u64) -> &Mutex<Option<RecentCall>> {
        &self.slots[(id % self.slots.len() as u64) as usize]
    }

    /// 对槽位中仍属于 `id` 的记录执行修改
    fn update(&self, id: u64, f: impl FnOnce(&mut RecentCall)) {
        if let Ok(mut guard) = self.slot(id).lock() {
            if let Some(call) = guard.as_mut().filter(|c| c.id == id) {
                f(call);
            }
        }
    }

    /// 准入时追加一条记录，返回单调递增的 id
    pub fn record_request(&self, start: CallStart<'_>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let content_type = start
            .headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        let request_body = (self.config.persist_bodies && !start.body.is_empty())
            .then(|| RecordedBody::capture(start.body, content_type, self.config.max_body_bytes));
        let call = RecentCall {
            id,
            request_id: start.request_id.to_string(),
            method: start.method.to_string(),
            path: start.path.to_string(),
            created_at: now_timestamp(),
            request_headers: masked_headers(start.headers),
            request_body,
            status: None,
            response_headers: BTreeMap::new(),
            response_body: None,
            stream_chunks: Vec::new(),
            stream_text: String::new(),
            stream_truncated: false,
            error: None,
            is_stream: false,
            response_buffer: Vec::new(),
            response_type: None,
        };
        if let Ok(mut guard) = self.slot(id).lock() {
            *guard = Some(call);
        }
        id
    }

    /// 记录响应状态与响应头
    pub fn record_response(&self, id: u64, status: u16, headers: &HeaderMap) {
        let content_type = headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        self.update(id, |call| {
            call.status = Some(status);
            call.response_headers = masked_headers(headers);
            call.is_stream = content_type.as_deref().is_some_and(|c| c.starts_with("text/event-stream"));
            call.response_type = content_type;
        });
    }

    /// 追加一段响应体
    pub fn append_chunk(&self, id: u64, chunk: &[u8]) {
        if !self.config.persist_bodies {
            return;
        }
        let max_body = self.config.max_body_bytes;
        let max_chunk = self.config.max_chunk_bytes;
        let max_chunks = self.config.max_chunks;
        self.update(id, |call| {
            if call.is_stream {
                if call.stream_chunks.len() >= max_chunks {
                    call.stream_truncated = true;
                    return;
                }
                let text = String::from_utf8_lossy(chunk);
                call.stream_text.push_str(&sse_text(&text));
                let mut stored: String = text.chars().take(max_chunk).collect();
                if stored.len() < text.len() {
                    stored.push('…');
                    call.stream_truncated = true;
                }
                call.stream_chunks.push(stored);
            } else {
                let room = max_body.saturating_sub(call.response_buffer.len());
                call.response_buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
                let size = call.response_body.as_ref().map_or(0, |b| b.size) + chunk.len();
                let mut body = RecordedBody::capture(&call.response_buffer, call.response_type.as_deref(), max_body);
                body.size = size;
                body.truncated = size > max_body;
                call.response_body = Some(body);
            }
        });
    }

    /// 记录最终错误
    pub fn record_error(&self, id: u64, message: &str) {
        self.update(id, |call| call.error = Some(message.to_string()));
    }

    /// 按 id 降序返回当前全部记录
    #[must_use]
    pub fn list(&self) -> Vec<RecentCall> {
        let mut calls: Vec<RecentCall> = self
            .slots
            .iter()
            .filter_map(|slot| slot.lock().ok().and_then(|guard| guard.clone()))
            .collect();
        calls.sort_by(|a, b| b.id.cmp(&a.id));
        calls
    }

    #[must_use]
    pub fn get(&self, id: u64) -> Option<RecentCall> {
        self.slot(id)
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .filter(|c| c.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;

    fn config(capacity: usize) -> RecentCallsConfig {
        RecentCallsConfig {
            capacity,
            max_body_bytes: 16,
            max_chunk_bytes: 64,
            max_chunks: 2,
            persist_bodies: true,
        }
    }

    fn start<'a>(headers: &'a HeaderMap, body: &'a [u8]) -> CallStart<'a> {
        CallStart {
            request_id: "req",
            method: "POST",
            path: "/v1/chat/completions",
            headers,
            body,
        }
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let calls = RecentCalls::new(config(2));
        let headers = HeaderMap::new();
        let ids: Vec<u64> = (0..3).map(|_| calls.record_request(start(&headers, b""))).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let listed: Vec<u64> = calls.list().iter().map(|c| c.id).collect();
        assert_eq!(listed, vec![3, 2]);
        assert!(calls.get(1).is_none());
    }

    #[test]
    fn test_masks_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-abcdefghijklmnop"));
        headers.insert("x-api-key", HeaderValue::from_static("short"));
        let masked = masked_headers(&headers);
        assert_eq!(masked["authorization"], "Bearer sk-a****mnop");
        assert_eq!(masked["x-api-key"], "****");
    }

    #[test]
    fn test_body_truncation_and_binary() {
        let calls = RecentCalls::new(config(4));
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let id = calls.record_request(start(&headers, br#"{"model":"gpt-4o","messages":[]}"#));
        let body = calls.get(id).unwrap().request_body.unwrap();
        assert_eq!(body.kind, "json");
        assert!(body.truncated);
        assert_eq!(body.content.len(), 16);

        let mut response_headers = HeaderMap::new();
        response_headers.insert("content-type", HeaderValue::from_static("audio/mpeg"));
        calls.record_response(id, 200, &response_headers);
        calls.append_chunk(id, &[0xff, 0xfb, 0x90]);
        let body = calls.get(id).unwrap().response_body.unwrap();
        assert_eq!(body.kind, "binary");
        assert_eq!(body.content, BASE64.encode([0xff, 0xfb, 0x90]));
    }

    #[test]
    fn test_stream_chunks_aggregate_text() {
        let calls = RecentCalls::new(config(4));
        let id = calls.record_request(start(&HeaderMap::new(), b""));
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/event-stream"));
        calls.record_response(id, 200, &headers);
        calls.append_chunk(id, b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n");
        calls.append_chunk(id, b"data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n");
        calls.append_chunk(id, b"data: [DONE]\n\n");
        let call = calls.get(id).unwrap();
        assert_eq!(call.stream_text, "Hello");
        assert_eq!(call.stream_chunks.len(), 2);
        assert!(call.stream_truncated);
    }

    #[test]
    fn test_headers_only_mode() {
        let calls = RecentCalls::new(RecentCallsConfig {
            persist_bodies: false,
            ..config(2)
        });
        let id = calls.record_request(start(&HeaderMap::new(), b"{}"));
        calls.append_chunk(id, b"{}");
        let call = calls.get(id).unwrap();
        assert!(call.request_body.is_none());
        assert!(call.response_body.is_none());
    }
}
