//! # 响应通道
//!
//! 转发任务把响应头与响应体写入有界通道，处理器把接收端包装为 axum 响应。
//! 响应头只能发送一次；发送之后不再允许重试。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use crate::recent_calls::RecentCalls;

pub type BodyChunk = std::result::Result<Bytes, io::Error>;

/// 响应头
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// 处理器持有的接收端
#[derive(Debug)]
pub struct SinkReceiver {
    pub head: oneshot::Receiver<ResponseHead>,
    pub body: mpsc::Receiver<BodyChunk>,
}

/// 转发任务持有的发送端
#[derive(Debug)]
pub struct ResponseSink {
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: mpsc::Sender<BodyChunk>,
    cancel: CancellationToken,
    max_bytes: u64,
    sent_bytes: u64,
    recorder: Option<(Arc<RecentCalls>, u64)>,
}

/// 创建一对发送端与接收端
#[must_use]
pub fn channel(buffer: usize, max_bytes: u64, cancel: CancellationToken) -> (ResponseSink, SinkReceiver) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(buffer.max(1));
    (
        ResponseSink {
            head_tx: Some(head_tx),
            body_tx,
            cancel,
            max_bytes,
            sent_bytes: 0,
            recorder: None,
        },
        SinkReceiver {
            head: head_rx,
            body: body_rx,
        },
    )
}

impl ResponseSink {
    /// 同时记录到最近调用环
    pub fn attach_recorder(&mut self, calls: Arc<RecentCalls>, id: u64) {
        self.recorder = Some((calls, id));
    }

    /// 响应头是否已经发出
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.head_tx.is_none()
    }

    #[must_use]
    pub const fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// 发送响应头，重复调用无效
    pub fn start(&mut self, status: StatusCode, headers: HeaderMap) -> Result<()> {
        let Some(tx) = self.head_tx.take() else {
            return Ok(());
        };
        if let Some((calls, id)) = &self.recorder {
            calls.record_response(*id, status.as_u16(), &headers);
        }
        tx.send(ResponseHead { status, headers })
            .map_err(|_| RelayError::ClientGone)
    }

    pub fn start_json(&mut self, status: StatusCode) -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.start(status, headers)
    }

    pub fn start_sse(&mut self) -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        self.start(StatusCode::OK, headers)
    }

    /// 发送一段响应体；客户端断开或超出字节上限时返回错误
    pub async fn send(&mut self, chunk: Bytes) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        if !self.is_started() {
            return Err(RelayError::internal("响应头尚未发送"));
        }
        self.sent_bytes += chunk.len() as u64;
        if self.max_bytes > 0 && self.sent_bytes > self.max_bytes {
            return Err(RelayError::internal(format!(
                "响应超过大小上限 {} 字节",
                self.max_bytes
            )));
        }
        if let Some((calls, id)) = &self.recorder {
            calls.append_chunk(*id, &chunk);
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(RelayError::ClientGone),
            sent = self.body_tx.send(Ok(chunk)) => sent.map_err(|_| RelayError::ClientGone),
        }
    }

    /// 一次性发送完整响应
    pub async fn send_full(&mut self, status: StatusCode, headers: HeaderMap, body: Bytes) -> Result<()> {
        self.start(status, headers)?;
        self.send(body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_head_then_body() {
        let (mut sink, mut rx) = channel(4, 0, CancellationToken::new());
        assert!(sink.send(Bytes::from_static(b"x")).await.is_err());

        sink.start_json(StatusCode::OK).unwrap();
        assert!(sink.is_started());
        sink.send(Bytes::from_static(b"{}")).await.unwrap();
        drop(sink);

        let head = rx.head.await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(rx.body.recv().await.unwrap().unwrap(), Bytes::from_static(b"{}"));
        assert!(rx.body.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_byte_cap() {
        let (mut sink, _rx) = channel(4, 3, CancellationToken::new());
        sink.start_sse().unwrap();
        sink.send(Bytes::from_static(b"ab")).await.unwrap();
        assert!(sink.send(Bytes::from_static(b"cd")).await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_client() {
        let cancel = CancellationToken::new();
        let (mut sink, rx) = channel(1, 0, cancel.clone());
        sink.start_sse().unwrap();
        cancel.cancel();
        let err = sink.send(Bytes::from_static(b"data")).await.unwrap_err();
        assert!(matches!(err, RelayError::ClientGone));
        drop(rx);
    }
}
