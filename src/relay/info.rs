//! # 单次转发的上下文
//!
//! 在处理器中创建，选中渠道后绑定渠道信息；重试时重新绑定，`retry_request_id` 保持不变。

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::adaptor::stream::StreamCollector;
use crate::channel::Selection;
use crate::config::RuntimeOptions;
use crate::types::{
    BillingSource, ChannelId, ProviderKind, Quota, RelayFormat, RelayMode, TokenId, UserId,
};

/// 生成请求 id
#[must_use]
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// 转发上下文
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub request_id: String,
    /// 一次请求内所有重试共享
    pub retry_request_id: String,
    pub format: RelayFormat,
    pub mode: RelayMode,
    /// 客户端请求的模型
    pub origin_model: String,
    /// 发往上游的模型（映射、剥离后缀后）
    pub upstream_model: String,
    pub is_stream: bool,
    /// OpenAI 客户端是否请求了末尾用量块
    pub include_usage: bool,

    pub user_id: UserId,
    pub token_id: TokenId,
    pub user_group: String,
    pub using_group: String,
    pub client_ip: String,
    pub request_path: String,
    pub query: String,
    /// Gemini 路径中的动作，如 `streamGenerateContent`
    pub gemini_action: Option<String>,

    pub channel_id: ChannelId,
    pub channel_name: String,
    pub provider: ProviderKind,
    pub base_url: String,
    pub key_index: usize,
    pub api_key: String,
    pub header_overrides: HashMap<String, String>,
    pub channel_other: Value,
    pub retry_count: u32,

    pub reasoning_effort: Option<String>,
    pub thinking: bool,
    pub refusal: bool,

    /// 准入时估算的输入 token
    pub prompt_tokens: u64,
    pub pre_consumed_quota: Quota,
    pub billing_source: Option<BillingSource>,
    /// 当前派发已输出的内容，流被截断时据此结算
    pub partial: StreamCollector,

    pub options: Arc<RuntimeOptions>,
    pub started_at: Instant,
    pub first_response_at: Option<Instant>,
}

impl RelayInfo {
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        format: RelayFormat,
        mode: RelayMode,
        model: impl Into<String>,
        options: Arc<RuntimeOptions>,
    ) -> Self {
        let request_id = request_id.into();
        let model = model.into();
        Self {
            retry_request_id: request_id.clone(),
            request_id,
            format,
            mode,
            upstream_model: model.clone(),
            origin_model: model,
            is_stream: false,
            include_usage: false,
            user_id: 0,
            token_id: 0,
            user_group: "default".to_string(),
            using_group: "default".to_string(),
            client_ip: String::new(),
            request_path: String::new(),
            query: String::new(),
            gemini_action: None,
            channel_id: 0,
            channel_name: String::new(),
            provider: ProviderKind::OpenAi,
            base_url: String::new(),
            key_index: 0,
            api_key: String::new(),
            header_overrides: HashMap::new(),
            channel_other: Value::Null,
            retry_count: 0,
            reasoning_effort: None,
            thinking: false,
            refusal: false,
            prompt_tokens: 0,
            pre_consumed_quota: 0,
            billing_source: None,
            partial: StreamCollector::default(),
            options,
            started_at: Instant::now(),
            first_response_at: None,
        }
    }

    /// 绑定选中的渠道与密钥，重置与渠道相关的派生字段
    pub fn bind_channel(&mut self, selection: &Selection) {
        let channel = &selection.channel;
        self.channel_id = channel.id;
        self.channel_name.clone_from(&channel.name);
        self.provider = channel.provider;
        self.base_url.clone_from(&channel.base_url);
        self.key_index = selection.key_index;
        self.api_key = channel
            .key(selection.key_index)
            .map(|k| k.secret.clone())
            .unwrap_or_default();
        self.header_overrides.clone_from(&channel.header_overrides);
        self.channel_other = channel.other.clone();
        self.upstream_model = channel.upstream_model(&self.origin_model);
        self.thinking = false;
        self.refusal = false;
        self.first_response_at = None;
    }

    /// 上游原生协议
    #[must_use]
    pub const fn upstream_format(&self) -> RelayFormat {
        self.provider.native_format()
    }

    /// 上游与客户端协议一致，响应原样转发
    #[must_use]
    pub fn is_passthrough(&self) -> bool {
        self.upstream_format() == self.format
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 首字节耗时
    #[must_use]
    pub fn first_response_latency(&self) -> Option<Duration> {
        self.first_response_at
            .map(|at| at.saturating_duration_since(self.started_at))
    }

    pub fn mark_first_response(&mut self) {
        if self.first_response_at.is_none() {
            self.first_response_at = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;

    #[test]
    fn test_bind_channel_applies_mapping() {
        let mut channel = Channel::new(7, ProviderKind::Anthropic, "https://c.example.com", "sk-c");
        channel
            .model_mapping
            .insert("claude-latest".into(), "claude-sonnet-4".into());
        let selection = Selection {
            channel: Arc::new(channel),
            key_index: 0,
            from_affinity: false,
        };

        let mut info = RelayInfo::new(
            "req-1",
            RelayFormat::OpenAi,
            RelayMode::Chat,
            "claude-latest",
            Arc::new(RuntimeOptions::default()),
        );
        info.bind_channel(&selection);

        assert_eq!(info.channel_id, 7);
        assert_eq!(info.upstream_model, "claude-sonnet-4");
        assert_eq!(info.api_key, "sk-c");
        assert_eq!(info.upstream_format(), RelayFormat::Claude);
        assert!(!info.is_passthrough());
        assert_eq!(info.retry_request_id, "req-1");
    }
}
