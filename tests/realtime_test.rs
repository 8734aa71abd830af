//! # 实时会话集成测试
//!
//! 网关挂在真实端口上，客户端与上游均为 WebSocket；
//! 会话持续时间超过对账窗口时仍按 `response.done` 用量结算。

mod common;

use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use common::{API_KEY, Gateway, USER_ID, openai_channel, token, user};
use relay_gateway::billing::Reconciler;
use relay_gateway::config::RuntimeOptions;
use relay_gateway::store::{LogKind, MemoryStore};
use relay_gateway::types::BillingPreference;

const WALLET: i64 = 10_000_000;
const MODEL: &str = "gpt-4o-realtime";

/// 每收到一条文本消息就回一个带用量的 `response.done`
async fn realtime_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        while let Some(Ok(message)) = socket.next().await {
            match message {
                Message::Text(_) => {
                    let done = json!({
                        "type": "response.done",
                        "response": {"usage": {
                            "total_tokens": 150,
                            "input_tokens": 100,
                            "output_tokens": 50
                        }}
                    });
                    if socket.send(Message::Text(done.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });
    addr
}

type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// 发起一次响应并等到 `response.done`
async fn exchange(client: &mut Client) {
    client
        .send(Message::Text(json!({"type": "response.create"}).to_string().into()))
        .await
        .unwrap();
    loop {
        match client.next().await {
            Some(Ok(Message::Text(text))) => {
                let event: Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(event["type"], "response.done");
                return;
            }
            Some(Ok(_)) => {}
            other => panic!("会话提前结束: {other:?}"),
        }
    }
}

async fn serve(gateway: &Gateway) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = gateway.router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_outliving_reconcile_window_is_billed() {
    let upstream = realtime_upstream().await;
    let store = MemoryStore::new();
    store.insert_user(user(WALLET, BillingPreference::WalletFirst));
    store.insert_token(token(WALLET));
    let mut channel = openai_channel(80, &format!("http://{upstream}"), 0);
    channel.models = vec![MODEL.into()];
    store.insert_channel(channel);

    let options = RuntimeOptions {
        model_ratio: HashMap::from([(MODEL.to_string(), 1.0)]),
        ..RuntimeOptions::default()
    };
    // 对账窗口 1 + 2 秒，会话每秒刷新一次活动时间
    let gateway = Gateway::start_with(store.clone(), options, |config| {
        config.relay.timeout_secs = 1;
        config.relay.realtime_heartbeat_secs = 1;
        config.billing.reconcile_grace_secs = 2;
    })
    .await;
    let addr = serve(&gateway).await;

    let mut request = format!("ws://{addr}/v1/realtime?model={MODEL}")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("authorization", format!("Bearer {API_KEY}").parse().unwrap());
    let (mut client, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    exchange(&mut client).await;

    // 会话存活超过对账窗口
    tokio::time::sleep(Duration::from_millis(4_500)).await;
    let reconciler = Reconciler::new(gateway.services.relay().billing().clone(), 1, 2);
    assert_eq!(reconciler.run_once().await.unwrap(), 0);

    exchange(&mut client).await;
    client.close(None).await.unwrap();

    // 会话关闭后在后台结算
    let mut logs = store.all_logs().await;
    for _ in 0..200 {
        if logs.iter().any(|l| l.kind == LogKind::Consume) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        logs = store.all_logs().await;
    }
    assert!(logs.iter().all(|l| l.kind != LogKind::Refund && l.kind != LogKind::System));
    let consume: Vec<_> = logs.iter().filter(|l| l.kind == LogKind::Consume).collect();
    assert_eq!(consume.len(), 1);
    assert_eq!(consume[0].prompt_tokens, 200);
    assert_eq!(consume[0].completion_tokens, 100);
    assert!(consume[0].quota > 0);
    assert_eq!(store.user_quota(USER_ID), Some(WALLET - consume[0].quota));
}
