//! # 实时语音桥接
//!
//! 客户端 WebSocket 与上游 `openai_realtime` 端点之间双向转发消息。
//! 建连前按默认补全预算预扣，连接关闭后以累计的 `response.done` 用量结算。

use axum::extract::ws::{self, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, protocol::frame::coding::CloseCode};

use super::{RelayInfo, RelayService};
use crate::adaptor::endpoint::{ChannelEndpoints, EndpointKey};
use crate::billing::{BillingSnapshot, PreConsumeRequest, Settlement};
use crate::channel::SelectionRequest;
use crate::error::{NetworkClass, RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::ratelimit::AdmissionRequest;
use crate::types::Usage;
use crate::{ldebug, linfo, lwarn};

const REALTIME_PATH: &str = "/v1/realtime";

/// 从 `response.done` 事件中取出用量
#[must_use]
pub fn realtime_usage(event: &Value) -> Option<Usage> {
    if event.get("type").and_then(Value::as_str) != Some("response.done") {
        return None;
    }
    let usage = event.pointer("/response/usage")?;
    let field = |pointer: &str| usage.pointer(pointer).and_then(Value::as_u64).unwrap_or(0);
    let mut parsed = Usage::new(field("/input_tokens"), field("/output_tokens"));
    parsed.total_tokens = field("/total_tokens").max(parsed.total_tokens);
    parsed.cached_tokens = field("/input_token_details/cached_tokens");
    parsed.audio_prompt_tokens = field("/input_token_details/audio_tokens");
    parsed.audio_completion_tokens = field("/output_token_details/audio_tokens");
    Some(parsed)
}

/// 会话内多次响应的用量累加
fn accumulate(total: &mut Usage, delta: &Usage) {
    total.prompt_tokens += delta.prompt_tokens;
    total.completion_tokens += delta.completion_tokens;
    total.total_tokens += delta.total_tokens;
    total.cached_tokens += delta.cached_tokens;
    total.audio_prompt_tokens += delta.audio_prompt_tokens;
    total.audio_completion_tokens += delta.audio_completion_tokens;
}

fn to_upstream(message: ws::Message) -> Option<tungstenite::Message> {
    Some(match message {
        ws::Message::Text(text) => tungstenite::Message::Text(text.as_str().into()),
        ws::Message::Binary(data) => tungstenite::Message::Binary(data),
        ws::Message::Ping(data) => tungstenite::Message::Ping(data),
        ws::Message::Pong(data) => tungstenite::Message::Pong(data),
        ws::Message::Close(frame) => tungstenite::Message::Close(frame.map(|f| {
            tungstenite::protocol::CloseFrame {
                code: CloseCode::from(f.code),
                reason: f.reason.as_str().into(),
            }
        })),
    })
}

fn to_client(message: tungstenite::Message) -> Option<ws::Message> {
    Some(match message {
        tungstenite::Message::Text(text) => ws::Message::Text(text.as_str().into()),
        tungstenite::Message::Binary(data) => ws::Message::Binary(data),
        tungstenite::Message::Ping(data) => ws::Message::Ping(data),
        tungstenite::Message::Pong(data) => ws::Message::Pong(data),
        tungstenite::Message::Close(frame) => ws::Message::Close(frame.map(|f| ws::CloseFrame {
            code: u16::from(f.code),
            reason: f.reason.as_str().into(),
        })),
        tungstenite::Message::Frame(_) => return None,
    })
}

/// 构造上游握手请求
fn upstream_request(info: &RelayInfo) -> Result<tungstenite::handshake::client::Request> {
    let url = ChannelEndpoints::parse(&info.base_url)?.resolve(
        EndpointKey::OpenaiRealtime,
        &info.upstream_model,
        REALTIME_PATH,
        &format!("model={}", info.upstream_model),
    )?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| RelayError::config(format!("实时端点地址无效: {e}")))?;
    let headers = request.headers_mut();
    let bearer = format!("Bearer {}", info.api_key)
        .parse()
        .map_err(|_| RelayError::config("渠道密钥包含非法字符"))?;
    headers.insert("authorization", bearer);
    headers.insert(
        "openai-beta",
        axum::http::HeaderValue::from_static("realtime=v1"),
    );
    crate::adaptor::apply_header_overrides(headers, &info.header_overrides, &info.api_key);
    Ok(request)
}

async fn close_with_error(mut socket: WebSocket, error: &RelayError) {
    let mut reason = error.client_message();
    // 关闭帧原因最多 123 字节
    while reason.len() > 120 {
        reason.pop();
    }
    let _ = socket
        .send(ws::Message::Close(Some(ws::CloseFrame {
            code: 1011,
            reason: reason.as_str().into(),
        })))
        .await;
}

impl RelayService {
    /// 桥接一个已升级的客户端连接
    pub async fn bridge_realtime(&self, mut info: RelayInfo, socket: WebSocket) {
        let rid = info.request_id.clone();
        let options = std::sync::Arc::clone(&info.options);
        let budget = u64::from(options.preconsume_completion_tokens);

        let admission = match self
            .limiter()
            .admit(&AdmissionRequest {
                request_id: &rid,
                user_id: info.user_id,
                group: &info.user_group,
                declared_tokens: budget,
            })
            .await
        {
            Ok(admission) => admission,
            Err(e) => {
                close_with_error(socket, &e).await;
                return;
            }
        };

        let selection = match self
            .selector()
            .select(&SelectionRequest {
                request_id: &rid,
                group: &info.using_group,
                model: &info.origin_model,
                retry_count: 0,
                tried: &HashSet::new(),
                token_id: info.token_id,
                client_ip: &info.client_ip,
                affinity: None,
            })
            .await
        {
            Ok(selection) => selection,
            Err(e) => {
                admission.permit.release().await;
                close_with_error(socket, &e).await;
                return;
            }
        };
        info.bind_channel(&selection);

        let snapshot = BillingSnapshot::capture(&options, &info.origin_model, &info.using_group, &info.user_group);
        let reserve = self
            .billing()
            .pre_consume(&PreConsumeRequest {
                request_id: &rid,
                user_id: info.user_id,
                token_id: info.token_id,
                channel_id: Some(selection.channel.id),
                model: &info.origin_model,
                quota: snapshot.estimate_preconsume(0, budget),
            })
            .await;
        if let Err(e) = reserve {
            admission.permit.release().await;
            close_with_error(socket, &e).await;
            return;
        }

        let upstream = match upstream_request(&info) {
            Ok(request) => tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| RelayError::network_with_source("实时上游连接失败", NetworkClass::Connect, e)),
            Err(e) => Err(e),
        };
        let upstream = match upstream {
            Ok((stream, _)) => stream,
            Err(e) => {
                lwarn!(
                    rid,
                    LogStage::UpstreamRequest,
                    LogComponent::Realtime,
                    "connect_failed",
                    "实时上游连接失败",
                    channel_id = info.channel_id,
                    error = %e
                );
                if let Err(refund_error) = self.billing().refund(&rid, &e.to_string()).await {
                    lwarn!(
                        rid,
                        LogStage::Billing,
                        LogComponent::Realtime,
                        "refund_failed",
                        "退还预扣失败，等待对账",
                        error = %refund_error
                    );
                }
                admission.permit.release().await;
                close_with_error(socket, &e).await;
                return;
            }
        };
        ldebug!(
            rid,
            LogStage::UpstreamRequest,
            LogComponent::Realtime,
            "connected",
            "实时会话已建立",
            channel_id = info.channel_id
        );

        let (mut client_tx, mut client_rx) = socket.split();
        let (mut upstream_tx, mut upstream_rx) = upstream.split();
        let mut usage = Usage::default();
        // 会话期间定期刷新预扣活动时间，对账任务不会退还仍在进行的会话
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(self.config().realtime_heartbeat_secs.max(1)));

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.billing().touch(&rid).await {
                        lwarn!(
                            rid,
                            LogStage::Billing,
                            LogComponent::Realtime,
                            "reservation_touch_failed",
                            "刷新预扣活动时间失败",
                            error = %e
                        );
                    }
                }
                message = client_rx.next() => {
                    let Some(Ok(message)) = message else { break };
                    let closing = matches!(message, ws::Message::Close(_));
                    if let Some(message) = to_upstream(message)
                        && upstream_tx.send(message).await.is_err()
                    {
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                message = upstream_rx.next() => {
                    let Some(Ok(message)) = message else { break };
                    if let tungstenite::Message::Text(text) = &message
                        && let Ok(event) = serde_json::from_str::<Value>(text.as_str())
                        && let Some(delta) = realtime_usage(&event)
                    {
                        info.mark_first_response();
                        accumulate(&mut usage, &delta);
                    }
                    let closing = matches!(message, tungstenite::Message::Close(_));
                    if let Some(message) = to_client(message)
                        && client_tx.send(message).await.is_err()
                    {
                        break;
                    }
                    if closing {
                        break;
                    }
                }
            }
        }
        let _ = upstream_tx.close().await;
        let _ = client_tx.close().await;

        let settlement = Settlement {
            quota: snapshot.quota_for(&usage),
            usage,
            channel_id: Some(selection.channel.id),
            model: info.origin_model.clone(),
            content: format!("mode={} billing={}", info.mode, snapshot.mode.as_str()),
        };
        if let Err(e) = self.billing().post_consume(&rid, &settlement).await {
            lwarn!(
                rid,
                LogStage::Billing,
                LogComponent::Realtime,
                "post_consume_failed",
                "实时会话结算失败，等待对账",
                error = %e
            );
        }
        self.limiter().settle_admission(&admission, usage.total_tokens).await;
        admission.permit.release().await;
        linfo!(
            rid,
            LogStage::Response,
            LogComponent::Realtime,
            "session_closed",
            "实时会话结束",
            channel_id = info.channel_id,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            elapsed_ms = info.elapsed().as_millis()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_usage_from_response_done() {
        let event = json!({
            "type": "response.done",
            "response": {"usage": {
                "total_tokens": 130,
                "input_tokens": 100,
                "output_tokens": 30,
                "input_token_details": {"cached_tokens": 20, "audio_tokens": 60},
                "output_token_details": {"audio_tokens": 25}
            }}
        });
        let usage = realtime_usage(&event).unwrap();
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.completion_tokens, 30);
        assert_eq!(usage.cached_tokens, 20);
        assert_eq!(usage.audio_prompt_tokens, 60);
        assert_eq!(usage.audio_completion_tokens, 25);
    }

    #[test]
    fn test_other_events_ignored() {
        assert!(realtime_usage(&json!({"type": "response.audio.delta"})).is_none());
        assert!(realtime_usage(&json!({"type": "response.done", "response": {}})).is_none());
    }

    #[test]
    fn test_usage_accumulates_across_responses() {
        let mut total = Usage::default();
        accumulate(&mut total, &Usage::new(10, 5));
        accumulate(&mut total, &Usage::new(7, 3));
        assert_eq!(total, Usage::new(17, 8));
    }

    #[test]
    fn test_close_frame_mapping() {
        let upstream = to_upstream(ws::Message::Close(Some(ws::CloseFrame {
            code: 1000,
            reason: "bye".into(),
        })))
        .unwrap();
        let back = to_client(upstream).unwrap();
        match back {
            ws::Message::Close(Some(frame)) => {
                assert_eq!(frame.code, 1000);
                assert_eq!(frame.reason.as_str(), "bye");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
