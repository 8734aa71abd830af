//! # 转发编排
//!
//! 单次请求的状态机：
//! 准入 → 亲和查找 → 选渠道 → 预扣 → 转换 → 派发 → 转发响应 → 结算。
//! 派发失败时按重试策略换渠道，耗尽或遇到不可重试错误时全额退还。
//!
//! 编排器运行在独立任务中，响应经由 [`ResponseSink`] 的有界通道交给处理器；
//! 响应头发出前的 panic 由处理器转换为通用 500。

use axum::body::Body;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::error_body::{ClientError, HEADER_REQUEST_ID, panic_response};
use super::mock;
use super::retry::RetryPolicy;
use super::{RelayInfo, ResponseSink, SinkReceiver};
use crate::adaptor::claude::types::MessagesRequest;
use crate::adaptor::gemini::types::GenerateContentRequest;
use crate::adaptor::openai::types::{ChatRequest, EmbeddingRequest};
use crate::adaptor::stream::StreamCollector;
use crate::adaptor::{Adaptor, AdaptorSet, RequestBody};
use crate::affinity::{AffinityCache, AffinityContext};
use crate::billing::{BillingEngine, BillingSnapshot, PreConsumeRequest, Settlement};
use crate::channel::{ChannelSelector, Selection, SelectionRequest, disable_reason, should_disable};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::logging::{LogComponent, LogStage, should_sample};
use crate::ratelimit::{Admission, AdmissionRequest, BudgetScope, RateLimiter};
use crate::recent_calls::RecentCalls;
use crate::types::{ChannelId, Usage};
use crate::{ldebug, lerror, linfo, lwarn, translation_error};

/// 客户端请求体，按入口协议区分
#[derive(Debug, Clone)]
pub enum ClientPayload {
    Chat(ChatRequest),
    Messages(MessagesRequest),
    Gemini(GenerateContentRequest),
    Completion(Value),
    Embedding(EmbeddingRequest),
    Rerank(Value),
    Responses(Value),
    Audio(RequestBody),
    Image(RequestBody),
    /// 只能同协议透传的原生请求，如 Gemini 原生向量接口
    Native(Value),
}

impl ClientPayload {
    /// 预扣用的补全 token 预估，未声明时取默认值
    #[must_use]
    pub fn completion_budget(&self, default: u32) -> u64 {
        let declared = match self {
            Self::Chat(r) => r.max_completion_tokens.or(r.max_tokens),
            Self::Messages(r) => (r.max_tokens > 0).then_some(r.max_tokens),
            Self::Gemini(r) => r.generation_config.as_ref().and_then(|c| c.max_output_tokens),
            Self::Completion(v) | Self::Responses(v) => v
                .get("max_tokens")
                .or_else(|| v.get("max_output_tokens"))
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok()),
            Self::Embedding(_) | Self::Rerank(_) | Self::Audio(_) | Self::Image(_) | Self::Native(_) => {
                return 0;
            }
        };
        u64::from(declared.unwrap_or(default))
    }

    async fn convert(self, adaptor: &dyn Adaptor, info: &mut RelayInfo) -> Result<RequestBody> {
        match self {
            Self::Chat(r) => adaptor.convert_openai_request(info, r).await,
            Self::Messages(r) => adaptor.convert_claude_request(info, r).await,
            Self::Gemini(r) => adaptor.convert_gemini_request(info, r).await,
            Self::Completion(v) => adaptor.convert_completion_request(info, v).await,
            Self::Embedding(r) => adaptor.convert_embedding_request(info, r).await,
            Self::Rerank(v) => adaptor.convert_rerank_request(info, v).await,
            Self::Responses(v) => adaptor.convert_responses_request(info, v).await,
            Self::Audio(body) => adaptor.convert_audio_request(info, body).await,
            Self::Image(body) => adaptor.convert_image_request(info, body).await,
            Self::Native(mut v) => {
                if !info.is_passthrough() {
                    return Err(translation_error!(
                        "{} 原生请求不能转发到 {} 渠道",
                        info.format,
                        info.provider
                    ));
                }
                if let Some(obj) = v.as_object_mut()
                    && obj.contains_key("model")
                {
                    obj.insert("model".to_string(), Value::String(info.upstream_model.clone()));
                }
                RequestBody::json(&v)
            }
        }
    }
}

/// 一次待转发的请求
#[derive(Debug)]
pub struct RelayRequest {
    pub info: RelayInfo,
    pub payload: ClientPayload,
    /// 客户端原始请求头
    pub headers: HeaderMap,
    /// 请求体 JSON，用于亲和规则的路径取值
    pub body_json: Option<Value>,
    /// 客户端声明的超时
    pub client_timeout: Option<Duration>,
    /// 最近调用环中的记录 id
    pub recent_id: Option<u64>,
}

/// 编排器依赖
pub struct RelayDeps {
    pub client: Client,
    pub adaptors: AdaptorSet,
    pub selector: Arc<ChannelSelector>,
    pub limiter: RateLimiter,
    pub billing: BillingEngine,
    pub affinity: Arc<AffinityCache>,
    pub recent_calls: Arc<RecentCalls>,
    pub config: RelayConfig,
}

/// 转发服务
pub struct RelayService {
    client: Client,
    adaptors: AdaptorSet,
    selector: Arc<ChannelSelector>,
    limiter: RateLimiter,
    billing: BillingEngine,
    affinity: Arc<AffinityCache>,
    recent_calls: Arc<RecentCalls>,
    config: RelayConfig,
}

/// 一次派发尝试的结果
enum Outcome {
    Completed(Usage),
    Failed(RelayError),
}

impl RelayService {
    #[must_use]
    pub fn new(deps: RelayDeps) -> Self {
        Self {
            client: deps.client,
            adaptors: deps.adaptors,
            selector: deps.selector,
            limiter: deps.limiter,
            billing: deps.billing,
            affinity: deps.affinity,
            recent_calls: deps.recent_calls,
            config: deps.config,
        }
    }

    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    #[must_use]
    pub const fn selector(&self) -> &Arc<ChannelSelector> {
        &self.selector
    }

    #[must_use]
    pub const fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    #[must_use]
    pub const fn billing(&self) -> &BillingEngine {
        &self.billing
    }

    #[must_use]
    pub const fn recent_calls(&self) -> &Arc<RecentCalls> {
        &self.recent_calls
    }

    /// 请求截止时间：客户端超时与转发超时取较小者
    fn deadline(&self, client_timeout: Option<Duration>) -> Option<Instant> {
        let relay = (self.config.timeout_secs > 0).then(|| Duration::from_secs(self.config.timeout_secs));
        let limit = match (relay, client_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        limit.map(|d| Instant::now() + d)
    }

    /// 在独立任务中转发，返回流式响应
    pub async fn serve(self: Arc<Self>, request: RelayRequest) -> Response {
        let format = request.info.format;
        let request_id = request.info.request_id.clone();
        let recent_id = request.recent_id;
        let cancel = CancellationToken::new();
        let (mut sink, receiver) = super::channel(
            self.config.stream_buffer_chunks,
            self.config.max_response_bytes,
            cancel.clone(),
        );
        if let Some(id) = recent_id {
            sink.attach_recorder(Arc::clone(&self.recent_calls), id);
        }

        let service = Arc::clone(&self);
        let handle = tokio::spawn(async move { service.execute(request, sink).await });

        let SinkReceiver { head, body } = receiver;
        if let Ok(head) = head.await {
            let guard = cancel.drop_guard();
            let stream = ReceiverStream::new(body).map(move |chunk| {
                let _ = &guard;
                chunk
            });
            let mut response = Response::new(Body::from_stream(stream));
            *response.status_mut() = head.status;
            *response.headers_mut() = head.headers;
            if let Ok(value) = request_id.parse() {
                response.headers_mut().insert(HEADER_REQUEST_ID, value);
            }
            return response;
        }

        let error = match handle.await {
            Ok(Err(e)) => e,
            Ok(Ok(())) => RelayError::internal("转发结束但未产生响应"),
            Err(join) => {
                lerror!(
                    request_id,
                    LogStage::Internal,
                    LogComponent::Relay,
                    "relay_panic",
                    "转发任务异常中止",
                    error = %join
                );
                if let Some(id) = recent_id {
                    self.recent_calls.record_error(id, "panic");
                }
                return panic_response(format, &request_id);
            }
        };
        if let Some(id) = recent_id {
            self.recent_calls.record_error(id, &error.to_string());
        }
        ClientError::new(error, format, request_id).into_response()
    }

    /// 编排主流程；响应头发出前的错误通过返回值交给处理器渲染
    pub async fn execute(&self, request: RelayRequest, mut sink: ResponseSink) -> Result<()> {
        let RelayRequest {
            mut info,
            payload,
            headers,
            body_json,
            client_timeout,
            ..
        } = request;
        let rid = info.request_id.clone();
        let options = Arc::clone(&info.options);

        if options.mock_traffic_enabled && mock::is_test_traffic(&headers) {
            mock::respond(&mut info, &mut sink).await?;
            return Ok(());
        }

        let completion_budget = payload.completion_budget(options.preconsume_completion_tokens);
        let admission = self
            .limiter
            .admit(&AdmissionRequest {
                request_id: &rid,
                user_id: info.user_id,
                group: &info.user_group,
                declared_tokens: info.prompt_tokens + completion_budget,
            })
            .await?;

        let affinity_key = self.affinity.resolve_key(
            &options.affinity_rules,
            &AffinityContext {
                user_id: info.user_id,
                token_id: info.token_id,
                client_ip: &info.client_ip,
                user_group: &info.user_group,
                using_group: &info.using_group,
                model: &info.origin_model,
                path: &info.request_path,
                body: body_json.as_ref(),
            },
        );
        let affinity = match &affinity_key {
            Some(key) => self.affinity.lookup(key).await,
            None => None,
        };

        let snapshot = BillingSnapshot::capture(&options, &info.origin_model, &info.using_group, &info.user_group);
        let estimate = snapshot.estimate_preconsume(info.prompt_tokens, completion_budget);
        let deadline = self.deadline(client_timeout);
        let policy = RetryPolicy::new(options.retry_times);

        let mut tried: HashSet<ChannelId> = HashSet::new();
        let mut reserved = false;
        let mut last_selection: Option<Selection> = None;
        let mut retry_count = 0;
        let mut last_error: Option<RelayError> = None;

        let outcome = loop {
            let selection = match self
                .selector
                .select(&SelectionRequest {
                    request_id: &rid,
                    group: &info.using_group,
                    model: &info.origin_model,
                    retry_count,
                    tried: &tried,
                    token_id: info.token_id,
                    client_ip: &info.client_ip,
                    affinity: if retry_count == 0 { affinity } else { None },
                })
                .await
            {
                Ok(selection) => selection,
                // 重试中选不到渠道时以最后一次上游错误为准
                Err(e) => break Outcome::Failed(last_error.take().unwrap_or(e)),
            };
            info.bind_channel(&selection);
            info.retry_count = retry_count;
            tried.insert(selection.channel.id);

            if !reserved {
                let reservation = self
                    .billing
                    .pre_consume(&PreConsumeRequest {
                        request_id: &rid,
                        user_id: info.user_id,
                        token_id: info.token_id,
                        channel_id: Some(selection.channel.id),
                        model: &info.origin_model,
                        quota: estimate,
                    })
                    .await;
                match reservation {
                    Ok(reservation) => {
                        info.pre_consumed_quota = reservation.quota;
                        info.billing_source = Some(reservation.source);
                        reserved = true;
                    }
                    Err(e) => {
                        admission.permit.release().await;
                        return Err(e);
                    }
                }
            }

            let result = self
                .attempt(&mut info, payload.clone(), &headers, &selection, deadline, &mut sink)
                .await;
            let error = match result {
                Ok(usage) => {
                    last_selection = Some(selection);
                    break Outcome::Completed(usage);
                }
                Err(e) => e,
            };

            if should_disable(&error) {
                self.selector
                    .registry()
                    .auto_disable(&rid, selection.channel.id, selection.key_index, &disable_reason(&error))
                    .await;
            }
            if selection.from_affinity
                && let Some(key) = &affinity_key
            {
                self.affinity.invalidate(key).await;
            }
            last_selection = Some(selection);

            let expired = deadline.is_some_and(|d| Instant::now() >= d);
            let decision = policy.evaluate_logged(&rid, &error, retry_count, sink.is_started());
            if !decision.should_retry || expired {
                break Outcome::Failed(error);
            }
            last_error = Some(error);
            retry_count += 1;
        };

        let result = match outcome {
            Outcome::Completed(usage) => {
                self.settle(&info, &snapshot, &usage, last_selection.as_ref(), &admission)
                    .await;
                if let (Some(key), Some(selection)) = (&affinity_key, &last_selection) {
                    self.affinity.bind(&rid, key, selection.channel.id).await;
                }
                if should_sample() {
                    linfo!(
                        rid,
                        LogStage::Response,
                        LogComponent::Relay,
                        "relay_completed",
                        "转发完成",
                        channel_id = info.channel_id,
                        model = %info.origin_model,
                        retries = info.retry_count,
                        prompt_tokens = usage.prompt_tokens,
                        completion_tokens = usage.completion_tokens,
                        first_response_ms = info.first_response_latency().map_or(0, |d| d.as_millis()),
                        elapsed_ms = info.elapsed().as_millis()
                    );
                }
                Ok(())
            }
            Outcome::Failed(error) if sink.is_started() => {
                // 响应已开始输出，按估算用量结算而不是退还
                lwarn!(
                    rid,
                    LogStage::ResponseFailure,
                    LogComponent::Relay,
                    "stream_aborted",
                    "响应中途终止，按估算用量结算",
                    channel_id = info.channel_id,
                    sent_bytes = sink.sent_bytes(),
                    error = %error
                );
                let usage = info.partial.settle(info.prompt_tokens);
                self.settle(&info, &snapshot, &usage, last_selection.as_ref(), &admission)
                    .await;
                Ok(())
            }
            Outcome::Failed(error) => {
                if reserved && let Err(e) = self.billing.refund(&rid, &error.to_string()).await {
                    lwarn!(
                        rid,
                        LogStage::Billing,
                        LogComponent::Relay,
                        "refund_failed",
                        "退还预扣失败，等待对账",
                        error = %e
                    );
                }
                lwarn!(
                    rid,
                    LogStage::ResponseFailure,
                    LogComponent::Relay,
                    "relay_failed",
                    "转发失败",
                    model = %info.origin_model,
                    retries = retry_count,
                    tried = tried.len(),
                    error = %error
                );
                Err(error)
            }
        };
        admission.permit.release().await;
        result
    }

    /// 在一个渠道上完成一次派发
    async fn attempt(
        &self,
        info: &mut RelayInfo,
        payload: ClientPayload,
        client_headers: &HeaderMap,
        selection: &Selection,
        deadline: Option<Instant>,
        sink: &mut ResponseSink,
    ) -> Result<Usage> {
        let adaptor = self.adaptors.adaptor_for(info.provider)?;
        info.partial = StreamCollector::default();
        adaptor.init(info);
        let body = payload.convert(adaptor.as_ref(), info).await?;
        let mut headers = HeaderMap::new();
        adaptor.setup_headers(client_headers, &mut headers, info)?;

        let channel = &selection.channel;
        let caps = channel.caps_for(&info.origin_model);
        self.limiter
            .record_channel_request(channel.id, selection.key_index, &info.origin_model, &caps)
            .await;
        if channel.daily_request_budget.is_some_and(|b| b > 0) {
            if info.token_id > 0 {
                self.limiter
                    .record_daily_budget(channel.id, &BudgetScope::Token(info.token_id))
                    .await;
            }
            if !info.client_ip.is_empty() {
                self.limiter
                    .record_daily_budget(channel.id, &BudgetScope::ClientIp(&info.client_ip))
                    .await;
            }
        }

        ldebug!(
            info.request_id,
            LogStage::UpstreamRequest,
            LogComponent::Relay,
            "dispatch",
            "派发到上游",
            channel_id = channel.id,
            key_index = selection.key_index,
            provider = %info.provider,
            upstream_model = %info.upstream_model,
            retry = info.retry_count
        );

        let cancel = sink.cancel_token().clone();
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RelayError::ClientGone),
            response = with_deadline(deadline, adaptor.do_request(&self.client, info, headers, body)) => response?,
        };
        with_deadline(deadline, adaptor.do_response(response, info, sink)).await
    }

    /// 结算计费与限流
    async fn settle(
        &self,
        info: &RelayInfo,
        snapshot: &BillingSnapshot,
        usage: &Usage,
        selection: Option<&Selection>,
        admission: &Admission,
    ) {
        let quota = snapshot.quota_for(usage);
        let settlement = Settlement {
            quota,
            usage: *usage,
            channel_id: selection.map(|s| s.channel.id),
            model: info.origin_model.clone(),
            content: format!("mode={} billing={}", info.mode, snapshot.mode.as_str()),
        };
        if let Err(e) = self.billing.post_consume(&info.request_id, &settlement).await {
            lwarn!(
                info.request_id,
                LogStage::Billing,
                LogComponent::Relay,
                "post_consume_failed",
                "结算失败，等待对账",
                quota = quota,
                error = %e
            );
        }

        self.limiter.settle_admission(admission, usage.total_tokens).await;
        if let Some(selection) = selection {
            let channel = &selection.channel;
            let caps = channel.caps_for(&info.origin_model);
            self.limiter
                .record_channel_tokens(
                    channel.id,
                    selection.key_index,
                    &info.origin_model,
                    &caps,
                    usage.total_tokens,
                )
                .await;
        }
    }
}

async fn with_deadline<T>(deadline: Option<Instant>, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await?,
        None => fut.await,
    }
}
