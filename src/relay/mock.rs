//! # 模拟流量
//!
//! 带 `X-Test-Traffic: true` 的请求在选项允许时直接返回固定回复，
//! 不选渠道、不计费、不访问上游。

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;

use super::{RelayInfo, ResponseSink};
use crate::adaptor::claude::convert::openai_to_claude_response;
use crate::adaptor::gemini::convert::openai_to_gemini_response;
use crate::adaptor::openai::types::{ChatChunk, ChatMessage, ChatResponse, Choice, Delta, MessageContent};
use crate::adaptor::stream::encoder_for;
use crate::adaptor::usage::count_tokens;
use crate::error::Result;
use crate::types::{RelayFormat, Usage, now_timestamp};

pub const HEADER_TEST_TRAFFIC: &str = "x-test-traffic";

/// 固定回复文本
pub const MOCK_REPLY: &str = "This is a mock response for test traffic.";

/// 请求是否标记为模拟流量
#[must_use]
pub fn is_test_traffic(headers: &HeaderMap) -> bool {
    headers
        .get(HEADER_TEST_TRAFFIC)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn mock_usage(info: &RelayInfo) -> Usage {
    Usage::new(info.prompt_tokens, count_tokens(MOCK_REPLY))
}

/// 以客户端协议写出固定回复
pub async fn respond(info: &mut RelayInfo, sink: &mut ResponseSink) -> Result<Usage> {
    let usage = mock_usage(info);
    let id = format!("chatcmpl-{}", info.request_id);
    let created = now_timestamp();
    info.mark_first_response();

    if info.is_stream {
        let mut encoder = encoder_for(info.format, info);
        let mut chunk = ChatChunk::new(id, info.origin_model.clone(), created);
        chunk = chunk.with_delta(
            Delta {
                role: Some("assistant".to_string()),
                content: Some(MOCK_REPLY.to_string()),
                ..Delta::default()
            },
            Some("stop".to_string()),
        );
        sink.start_sse()?;
        for frame in encoder.encode(&chunk) {
            sink.send(frame).await?;
        }
        for frame in encoder.finish(&usage) {
            sink.send(frame).await?;
        }
        return Ok(usage);
    }

    let response = ChatResponse {
        id,
        object: "chat.completion".to_string(),
        created,
        model: info.origin_model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: Some(MessageContent::Text(MOCK_REPLY.to_string())),
                ..ChatMessage::default()
            },
            finish_reason: Some("stop".to_string()),
        }],
        usage: Some((&usage).into()),
        ..ChatResponse::default()
    };
    let body = match info.format {
        RelayFormat::OpenAi => serde_json::to_vec(&response)?,
        RelayFormat::Claude => serde_json::to_vec(&openai_to_claude_response(response, &usage))?,
        RelayFormat::Gemini => serde_json::to_vec(&openai_to_gemini_response(response, &usage))?,
    };
    sink.start_json(StatusCode::OK)?;
    sink.send(Bytes::from(body)).await?;
    Ok(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeOptions;
    use crate::relay::channel;
    use crate::types::RelayMode;
    use axum::http::HeaderValue;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_header_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_test_traffic(&headers));
        headers.insert(HEADER_TEST_TRAFFIC, HeaderValue::from_static("TRUE"));
        assert!(is_test_traffic(&headers));
    }

    #[tokio::test]
    async fn test_claude_mock_body() {
        let mut info = RelayInfo::new(
            "req-m",
            RelayFormat::Claude,
            RelayMode::Chat,
            "claude-sonnet-4",
            Arc::new(RuntimeOptions::default()),
        );
        let (mut sink, mut rx) = channel(8, 0, CancellationToken::new());
        let usage = respond(&mut info, &mut sink).await.unwrap();
        drop(sink);
        assert!(usage.completion_tokens > 0);

        let head = rx.head.await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        let body = rx.body.recv().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["content"][0]["text"], MOCK_REPLY);
    }
}
