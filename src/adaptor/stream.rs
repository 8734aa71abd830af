//! # 聊天响应管线
//!
//! 上游响应先解码为 OpenAI 分片（流式）或 OpenAI 响应（非流式），再编码为客户端协议。
//! 同协议时原样转发，同时解析出文本与用量。

use axum::http::StatusCode;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use super::claude::convert::{claude_to_openai_response, openai_to_claude_response};
use super::claude::stream::{ClaudeStreamDecoder, ClaudeStreamEncoder};
use super::claude::types::MessagesResponse;
use super::gemini::convert::{gemini_to_openai_response, openai_to_gemini_response};
use super::gemini::stream::{GeminiStreamDecoder, GeminiStreamEncoder};
use super::gemini::types::GenerateContentResponse;
use super::openai::stream::{OpenAiStreamDecoder, OpenAiStreamEncoder};
use super::openai::types::{ChatChunk, ChatResponse};
use super::read_body;
use super::sse::{SseDecoder, SseEvent};
use super::usage::{count_tokens, estimate_usage};
use crate::error::{NetworkClass, RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::relay::{RelayInfo, ResponseSink};
use crate::types::{RelayFormat, Usage};
use crate::{ldebug, lwarn};

/// 上游事件 → OpenAI 分片
pub trait StreamDecoder: Send {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<ChatChunk>>;

    /// 流结束时补发尚未输出的分片
    fn finish(&mut self) -> Vec<ChatChunk> {
        Vec::new()
    }

    /// 上游是否以拒答结束
    fn refusal(&self) -> bool {
        false
    }
}

/// OpenAI 分片 → 客户端协议的 SSE 帧
pub trait StreamEncoder: Send {
    fn encode(&mut self, chunk: &ChatChunk) -> Vec<Bytes>;

    /// 流结束帧，附带最终用量
    fn finish(&mut self, usage: &Usage) -> Vec<Bytes>;
}

#[must_use]
pub fn decoder_for(format: RelayFormat, info: &RelayInfo) -> Box<dyn StreamDecoder> {
    match format {
        RelayFormat::OpenAi => Box::new(OpenAiStreamDecoder),
        RelayFormat::Claude => Box::new(ClaudeStreamDecoder::new(&info.upstream_model)),
        RelayFormat::Gemini => Box::new(GeminiStreamDecoder::new(&info.request_id, &info.upstream_model)),
    }
}

#[must_use]
pub fn encoder_for(format: RelayFormat, info: &RelayInfo) -> Box<dyn StreamEncoder> {
    match format {
        RelayFormat::OpenAi => Box::new(OpenAiStreamEncoder::new(info.include_usage)),
        RelayFormat::Claude => Box::new(ClaudeStreamEncoder::new(&info.request_id, &info.origin_model)),
        RelayFormat::Gemini => Box::new(GeminiStreamEncoder::new(&info.origin_model)),
    }
}

/// 收集流中的文本与最近一次上报的用量
///
/// 挂在 [`RelayInfo`] 上，响应中途被截止或客户端断开时仍可按已输出部分结算。
#[derive(Debug, Clone, Default)]
pub struct StreamCollector {
    pub text: String,
    pub usage: Option<Usage>,
    pub chunks: usize,
}

impl StreamCollector {
    pub fn observe(&mut self, chunk: &ChatChunk) {
        self.chunks += 1;
        for fragment in chunk.text_fragments() {
            self.text.push_str(fragment);
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(Usage::from(usage));
        }
    }

    /// 透传流中解析出的一段文本
    pub fn push_text(&mut self, text: &str) {
        self.chunks += 1;
        self.text.push_str(text);
    }

    pub fn report_usage(&mut self, usage: Usage) {
        self.usage = Some(usage);
    }

    /// 最终用量：上游上报优先，缺失部分按文本估算
    #[must_use]
    pub fn settle(&self, prompt_estimate: u64) -> Usage {
        settle_usage(self.usage, prompt_estimate, &self.text)
    }
}

/// 以上游用量为准，补齐缺失的输入或输出
#[must_use]
pub fn settle_usage(reported: Option<Usage>, prompt_estimate: u64, text: &str) -> Usage {
    let Some(mut usage) = reported.filter(|u| !u.is_empty()) else {
        return estimate_usage(prompt_estimate, text);
    };
    if usage.prompt_tokens == 0 {
        usage.prompt_tokens = prompt_estimate;
    }
    if usage.completion_tokens == 0 && !text.is_empty() {
        usage.completion_tokens = count_tokens(text);
    }
    usage.normalize();
    usage
}

/// 聊天类请求的响应处理入口
pub async fn relay_chat_response(
    response: reqwest::Response,
    info: &mut RelayInfo,
    sink: &mut ResponseSink,
) -> Result<Usage> {
    if info.is_stream {
        relay_stream(response, info, sink).await
    } else {
        relay_whole(response, info, sink).await
    }
}

async fn relay_stream(
    response: reqwest::Response,
    info: &mut RelayInfo,
    sink: &mut ResponseSink,
) -> Result<Usage> {
    let upstream = info.upstream_format();
    let passthrough = info.is_passthrough();
    let mut decoder = decoder_for(upstream, info);
    let mut encoder = encoder_for(info.format, info);
    info.partial = StreamCollector::default();

    let body = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    let mut events = FramedRead::new(StreamReader::new(body), SseDecoder::new());
    let cancel = sink.cancel_token().clone();

    sink.start_sse()?;
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RelayError::ClientGone),
            next = events.next() => next,
        };
        let event = match next {
            None => break,
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                // 已经开始输出，按已收到的内容结算
                lwarn!(
                    info.request_id,
                    LogStage::Response,
                    LogComponent::Adaptor,
                    "stream_interrupted",
                    "上游流中断",
                    error = %e,
                    chunks = info.partial.chunks
                );
                break;
            }
        };
        info.mark_first_response();

        let chunks = match decoder.decode(&event) {
            Ok(chunks) => chunks,
            Err(e) => {
                lwarn!(
                    info.request_id,
                    LogStage::Response,
                    LogComponent::Adaptor,
                    "stream_error_event",
                    "上游在流中返回错误",
                    error = %e
                );
                if passthrough {
                    sink.send(event.to_bytes()).await?;
                }
                break;
            }
        };
        for chunk in &chunks {
            info.partial.observe(chunk);
        }

        if passthrough {
            if event.is_done() {
                continue;
            }
            // 网关强制要求了用量，客户端没有要求时丢弃纯用量分片
            let hidden_usage = info.format == RelayFormat::OpenAi
                && !info.include_usage
                && !chunks.is_empty()
                && chunks.iter().all(ChatChunk::is_usage_only);
            if !hidden_usage {
                sink.send(event.to_bytes()).await?;
            }
        } else {
            for chunk in &chunks {
                for frame in encoder.encode(chunk) {
                    sink.send(frame).await?;
                }
            }
        }
    }

    for chunk in decoder.finish() {
        info.partial.observe(&chunk);
        if !passthrough {
            for frame in encoder.encode(&chunk) {
                sink.send(frame).await?;
            }
        }
    }
    info.refusal = decoder.refusal();

    let usage = info.partial.settle(info.prompt_tokens);
    if passthrough {
        if info.format == RelayFormat::OpenAi {
            sink.send(super::sse::done_frame()).await?;
        }
    } else {
        for frame in encoder.finish(&usage) {
            sink.send(frame).await?;
        }
    }

    ldebug!(
        info.request_id,
        LogStage::Response,
        LogComponent::Adaptor,
        "stream_complete",
        "流式响应转发完成",
        chunks = info.partial.chunks,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        reported = info.partial.usage.is_some()
    );
    Ok(usage)
}

async fn relay_whole(
    response: reqwest::Response,
    info: &mut RelayInfo,
    sink: &mut ResponseSink,
) -> Result<Usage> {
    let status = response.status();
    let bytes = read_body(response, 0).await?;
    if bytes.is_empty() {
        return Err(RelayError::network("上游返回空响应", NetworkClass::EmptyResponse));
    }
    info.mark_first_response();

    let upstream = info.upstream_format();
    let parsed = parse_whole_response(upstream, &bytes, &info.upstream_model);

    if info.is_passthrough() {
        let (usage, refusal) = match parsed {
            Ok((openai, refusal)) => (
                settle_usage(openai.usage.map(Usage::from), info.prompt_tokens, &openai.text()),
                refusal,
            ),
            Err(_) => (estimate_usage(info.prompt_tokens, ""), false),
        };
        info.refusal = refusal;
        sink.start_json(status_or_ok(status))?;
        sink.send(bytes).await?;
        return Ok(usage);
    }

    let (mut openai, refusal) = parsed?;
    info.refusal = refusal;
    let usage = settle_usage(openai.usage.map(Usage::from), info.prompt_tokens, &openai.text());
    openai.usage = Some((&usage).into());
    openai.model.clone_from(&info.origin_model);

    let body = match info.format {
        RelayFormat::OpenAi => serde_json::to_vec(&openai)?,
        RelayFormat::Claude => serde_json::to_vec(&openai_to_claude_response(openai, &usage))?,
        RelayFormat::Gemini => serde_json::to_vec(&openai_to_gemini_response(openai, &usage))?,
    };
    sink.start_json(StatusCode::OK)?;
    sink.send(Bytes::from(body)).await?;
    Ok(usage)
}

fn status_or_ok(status: reqwest::StatusCode) -> StatusCode {
    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK)
}

/// 把上游非流式响应解析为 OpenAI 形态，并返回是否拒答
pub fn parse_whole_response(
    upstream: RelayFormat,
    bytes: &[u8],
    model: &str,
) -> Result<(ChatResponse, bool)> {
    match upstream {
        RelayFormat::OpenAi => {
            let value: Value = serde_json::from_slice(bytes)?;
            let response: ChatResponse = serde_json::from_value(value)?;
            Ok((response, false))
        }
        RelayFormat::Claude => {
            let response: MessagesResponse = serde_json::from_slice(bytes)?;
            let refusal = response.stop_reason.as_deref() == Some("refusal");
            Ok((claude_to_openai_response(response), refusal))
        }
        RelayFormat::Gemini => {
            let response: GenerateContentResponse = serde_json::from_slice(bytes)?;
            Ok((gemini_to_openai_response(response, model), false))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::openai::types::{Delta, OpenAiUsage};

    #[test]
    fn test_collector_prefers_reported_usage() {
        let mut collector = StreamCollector::default();
        collector.observe(&ChatChunk::new("c", "m", 0).with_delta(Delta::content("hello"), None));
        let mut usage_chunk = ChatChunk::new("c", "m", 0);
        usage_chunk.usage = Some(OpenAiUsage {
            prompt_tokens: 9,
            completion_tokens: 2,
            total_tokens: 11,
            ..OpenAiUsage::default()
        });
        collector.observe(&usage_chunk);

        let usage = collector.settle(100);
        assert_eq!(usage.prompt_tokens, 9);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(collector.text, "hello");
    }

    #[test]
    fn test_collector_estimates_without_usage() {
        let mut collector = StreamCollector::default();
        collector.observe(&ChatChunk::new("c", "m", 0).with_delta(Delta::content("some words here"), None));
        let usage = collector.settle(42);
        assert_eq!(usage.prompt_tokens, 42);
        assert!(usage.completion_tokens > 0);
        assert_eq!(usage.total_tokens, 42 + usage.completion_tokens);
    }

    #[test]
    fn test_settle_fills_missing_prompt() {
        let usage = settle_usage(Some(Usage::new(0, 5)), 30, "abc");
        assert_eq!(usage.prompt_tokens, 30);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, 35);
    }

    #[test]
    fn test_parse_claude_refusal() {
        let body = br#"{"id":"msg_1","type":"message","role":"assistant","content":[],"model":"claude","stop_reason":"refusal","usage":{"input_tokens":3,"output_tokens":0}}"#;
        let (response, refusal) = parse_whole_response(RelayFormat::Claude, body, "claude").unwrap();
        assert!(refusal);
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("content_filter"));
    }
}
