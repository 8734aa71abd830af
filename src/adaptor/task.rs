//! # 异步任务适配器
//!
//! 视频、音乐等生成类平台以“提交 + 轮询”方式工作。提交沿用客户端路径转发，
//! 状态查询按渠道批量进行。

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::endpoint::{ChannelEndpoints, EndpointKey};
use super::{RequestBody, apply_header_overrides, common_headers, insert_secret, read_body, send_request};
use crate::channel::Channel;
use crate::error::{RelayError, Result};
use crate::relay::RelayInfo;
use crate::translation_error;
use crate::types::RelayMode;

/// 批量查询路径
pub const LIST_PATH: &str = "/task/list-by-condition";

/// 提交结果
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSubmission {
    pub upstream_task_id: String,
    /// 上游表示“已接受，稍后查询”
    pub accepted_later: bool,
    pub data: Value,
}

/// 上游返回的一条任务状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub upstream_task_id: String,
    /// 上游原始状态，由状态映射表归一
    pub status: String,
    pub progress: String,
    pub fail_reason: Option<String>,
    pub data: Value,
}

/// 任务平台适配器
#[async_trait]
pub trait TaskAdaptor: Send + Sync {
    fn platform(&self) -> &str;

    async fn submit(&self, client: &Client, client_headers: &HeaderMap, info: &RelayInfo, body: Value)
    -> Result<TaskSubmission>;

    /// 按上游任务 id 批量查询一个渠道上的任务
    async fn fetch(&self, client: &Client, channel: &Channel, upstream_ids: &[String]) -> Result<Vec<TaskUpdate>>;
}

/// 通用 JSON 任务平台
///
/// 提交响应中的任务 id 取 `task_id`、`id` 或 `data.task_id`；
/// 查询接口 `POST {base}/task/list-by-condition`，请求体 `{ids: [...]}`。
#[derive(Debug, Clone)]
pub struct JsonTaskAdaptor {
    platform: String,
}

impl JsonTaskAdaptor {
    #[must_use]
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
        }
    }
}

impl Default for JsonTaskAdaptor {
    fn default() -> Self {
        Self::new("task")
    }
}

fn string_at<'a>(value: &'a Value, pointers: &[&str]) -> Option<&'a str> {
    pointers
        .iter()
        .find_map(|p| value.pointer(p).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

/// 从提交响应中取出任务 id
pub fn parse_submission(status: u16, body: &[u8]) -> Result<TaskSubmission> {
    let value: Value = serde_json::from_slice(body)?;
    let upstream_task_id = string_at(&value, &["/task_id", "/id", "/data/task_id", "/data/id", "/result"])
        .ok_or_else(|| translation_error!("任务提交响应缺少任务 id"))?
        .to_string();
    Ok(TaskSubmission {
        upstream_task_id,
        accepted_later: status == StatusCode::ACCEPTED.as_u16()
            || status == StatusCode::NON_AUTHORITATIVE_INFORMATION.as_u16(),
        data: value,
    })
}

fn parse_update(item: &Value) -> Option<TaskUpdate> {
    let upstream_task_id = string_at(item, &["/task_id", "/id"])?.to_string();
    let status = string_at(item, &["/status", "/state"]).unwrap_or_default().to_string();
    let progress = match item.get("progress") {
        Some(Value::String(p)) => p.clone(),
        Some(Value::Number(n)) => format!("{n}%"),
        _ => String::new(),
    };
    let fail_reason = string_at(item, &["/fail_reason", "/error/message", "/error"]).map(ToString::to_string);
    Some(TaskUpdate {
        upstream_task_id,
        status,
        progress,
        fail_reason,
        data: item.clone(),
    })
}

/// 批量查询响应：顶层数组，或 `{data: [...]}`
pub fn parse_updates(body: &[u8]) -> Result<Vec<TaskUpdate>> {
    let value: Value = serde_json::from_slice(body)?;
    let items = match &value {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => obj.get("data").and_then(Value::as_array).map_or(&[][..], Vec::as_slice),
        _ => &[],
    };
    Ok(items.iter().filter_map(parse_update).collect())
}

#[async_trait]
impl TaskAdaptor for JsonTaskAdaptor {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn submit(
        &self,
        client: &Client,
        client_headers: &HeaderMap,
        info: &RelayInfo,
        body: Value,
    ) -> Result<TaskSubmission> {
        let url = ChannelEndpoints::parse(&info.base_url)?.resolve(
            EndpointKey::classify(RelayMode::TaskSubmit, info.upstream_format()),
            &info.upstream_model,
            &info.request_path,
            &info.query,
        )?;
        let mut headers = HeaderMap::new();
        common_headers(client_headers, &mut headers, info);
        insert_secret(&mut headers, "authorization", &format!("Bearer {}", info.api_key))?;
        apply_header_overrides(&mut headers, &info.header_overrides, &info.api_key);

        let mut body = body;
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".to_string(), Value::String(info.upstream_model.clone()));
        }
        let response = send_request(client, &url, headers, RequestBody::json(&body)?).await?;
        let status = response.status().as_u16();
        let bytes = read_body(response, 0).await?;
        parse_submission(status, &bytes)
    }

    async fn fetch(&self, client: &Client, channel: &Channel, upstream_ids: &[String]) -> Result<Vec<TaskUpdate>> {
        if upstream_ids.is_empty() {
            return Ok(Vec::new());
        }
        let secret = channel
            .enabled_key_indices()
            .next()
            .and_then(|i| channel.key(i))
            .map(|k| k.secret.clone())
            .ok_or_else(|| RelayError::no_available_channel("task", &self.platform))?;
        let url = ChannelEndpoints::parse(&channel.base_url)?.resolve(EndpointKey::Default, "", LIST_PATH, "")?;

        let mut headers = HeaderMap::new();
        insert_secret(&mut headers, "authorization", &format!("Bearer {secret}"))?;
        apply_header_overrides(&mut headers, &channel.header_overrides, &secret);
        let body = RequestBody::json(&serde_json::json!({ "ids": upstream_ids }))?;
        let response = send_request(client, &url, headers, body).await?;
        let bytes = read_body(response, 0).await?;
        parse_updates(&bytes)
    }
}
