//! # 协议转换性质测试
//!
//! OpenAI → Claude → OpenAI 往返保持角色序列、工具调用标识与结果绑定、文本内容；
//! 角色映射应用两次与应用一次结果相同。

use proptest::prelude::*;
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;

use relay_gateway::adaptor::claude::convert::{claude_to_openai_request, openai_to_claude_request};
use relay_gateway::adaptor::image::ImageFetcher;
use relay_gateway::adaptor::openai::types::{ChatMessage, ChatRequest, MessageContent, ToolCall};
use relay_gateway::adaptor::role_map::apply_role_mapping;

/// 一轮对话：用户发言后助手给出文本或工具调用
#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Tool { name: String, query: String },
}

fn word() -> impl Strategy<Value = String> {
    "[a-z]{1,10}( [a-z]{1,8}){0,3}"
}

fn reply() -> impl Strategy<Value = Reply> {
    prop_oneof![
        word().prop_map(Reply::Text),
        ("[a-z_]{3,12}", word()).prop_map(|(name, query)| Reply::Tool { name, query }),
    ]
}

fn conversation() -> impl Strategy<Value = (Option<String>, Vec<(String, Reply)>)> {
    (
        proptest::option::of(word()),
        proptest::collection::vec((word(), reply()), 1..6),
    )
}

fn build_messages(system: Option<String>, turns: Vec<(String, Reply)>) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(ChatMessage::text("system", system));
    }
    for (index, (user_text, reply)) in turns.into_iter().enumerate() {
        messages.push(ChatMessage::text("user", user_text));
        match reply {
            Reply::Text(text) => messages.push(ChatMessage::text("assistant", text)),
            Reply::Tool { name, query } => {
                let id = format!("call_{index}");
                let arguments = json!({ "q": query }).to_string();
                messages.push(ChatMessage {
                    role: "assistant".into(),
                    tool_calls: Some(vec![ToolCall::function(id.clone(), name, arguments)]),
                    ..ChatMessage::default()
                });
                messages.push(ChatMessage {
                    role: "tool".into(),
                    content: Some(MessageContent::Text(format!("result {index}"))),
                    tool_call_id: Some(id),
                    ..ChatMessage::default()
                });
            }
        }
    }
    messages
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 可比较的消息摘要：角色、文本、工具调用 (id, 名称, 参数)、工具结果绑定
fn summary(messages: &[ChatMessage]) -> Vec<(String, String, Vec<(String, String, Value)>, Option<String>)> {
    messages
        .iter()
        .map(|m| {
            let calls = m
                .tool_calls
                .iter()
                .flatten()
                .map(|c| {
                    let args = serde_json::from_str(&c.function.arguments).unwrap_or(Value::Null);
                    (c.id.clone(), c.function.name.clone(), args)
                })
                .collect();
            (m.role.clone(), normalize(&m.text_content()), calls, m.tool_call_id.clone())
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_openai_claude_roundtrip((system, turns) in conversation()) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let images = ImageFetcher::new(Client::new(), 1024, Duration::from_secs(1));
        let messages = build_messages(system, turns);
        let request = ChatRequest {
            model: "claude-sonnet-4".into(),
            messages: messages.clone(),
            ..ChatRequest::default()
        };

        let claude = runtime.block_on(openai_to_claude_request(request, &images)).unwrap();
        let back = claude_to_openai_request(claude);

        prop_assert_eq!(summary(&back.messages), summary(&messages));
    }

    #[test]
    fn prop_role_mapping_is_idempotent(
        mapping in proptest::collection::hash_map(
            prop::sample::select(vec!["system", "developer", "user", "assistant", "tool"]),
            prop::sample::select(vec!["system", "developer", "user", "assistant", "tool"]),
            0..5,
        ),
        roles in proptest::collection::vec(
            prop::sample::select(vec!["system", "developer", "user", "assistant", "tool"]),
            1..8,
        ),
    ) {
        let table: HashMap<String, HashMap<String, String>> = HashMap::from([(
            "o1*".to_string(),
            mapping
                .into_iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
        )]);
        let mut once: Vec<ChatMessage> = roles.iter().map(|r| ChatMessage::text(*r, "x")).collect();
        apply_role_mapping(&table, "o1-preview", &mut once);
        let mut twice = once.clone();
        apply_role_mapping(&table, "o1-preview", &mut twice);

        let once_roles: Vec<&str> = once.iter().map(|m| m.role.as_str()).collect();
        let twice_roles: Vec<&str> = twice.iter().map(|m| m.role.as_str()).collect();
        prop_assert_eq!(once_roles, twice_roles);
    }
}
