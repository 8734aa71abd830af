//! # 令牌认证
//!
//! 从 `Authorization: Bearer`、`x-api-key`、`x-goog-api-key`、`?key=` 或 WebSocket 子协议中取出密钥，
//! 按 SHA-256 摘要查找令牌，校验令牌与用户状态后把 [`AuthContext`] 放入请求扩展。

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;

use super::state::ServerState;
use crate::error::{RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::lwarn;
use crate::relay::{ClientError, new_request_id};
use crate::store::{Repositories, Token};
use crate::types::{RelayFormat, TokenId, UserId, now_timestamp};

/// WebSocket 客户端通过子协议携带密钥时使用的前缀
const WS_KEY_PROTOCOL_PREFIX: &str = "openai-insecure-api-key.";

/// 认证通过后的调用方信息
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: UserId,
    pub token_id: TokenId,
    pub user_group: String,
    pub using_group: String,
    pub client_ip: String,
    pub token: Token,
}

impl AuthContext {
    /// 令牌是否可以访问该模型
    pub fn ensure_model(&self, model: &str) -> Result<()> {
        if self.token.allows_model(model) {
            Ok(())
        } else {
            Err(RelayError::ModelNotPermitted {
                model: model.to_string(),
            })
        }
    }
}

/// 密钥摘要
#[must_use]
pub fn hash_key(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// 按优先级从请求中取出密钥
#[must_use]
pub fn extract_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(auth) = header_value(header::AUTHORIZATION.as_str()) {
        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .unwrap_or(auth)
            .trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    if let Some(key) = header_value("x-api-key").or_else(|| header_value("x-goog-api-key")) {
        return Some(key.to_string());
    }
    if let Some(query) = query
        && let Some((_, key)) = url::form_urlencoded::parse(query.as_bytes()).find(|(k, _)| k == "key")
        && !key.is_empty()
    {
        return Some(key.into_owned());
    }
    header_value(header::SEC_WEBSOCKET_PROTOCOL.as_str()).and_then(|protocols| {
        protocols
            .split(',')
            .map(str::trim)
            .find_map(|p| p.strip_prefix(WS_KEY_PROTOCOL_PREFIX))
            .filter(|k| !k.is_empty())
            .map(ToString::to_string)
    })
}

/// 客户端地址：优先取 `X-Forwarded-For` 的第一段
#[must_use]
pub fn client_ip(request: &Request) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_default()
}

/// 错误响应使用的协议，按入口路径判断
#[must_use]
pub fn format_for_path(path: &str) -> RelayFormat {
    if path.starts_with("/v1/messages") {
        RelayFormat::Claude
    } else if path.starts_with("/v1beta/") {
        RelayFormat::Gemini
    } else {
        RelayFormat::OpenAi
    }
}

/// 校验密钥并组装调用方信息
pub async fn resolve(repos: &Repositories, secret: &str, client_ip: String) -> Result<AuthContext> {
    let token = repos
        .tokens
        .find_token_by_hash(&hash_key(secret))
        .await?
        .ok_or_else(|| RelayError::auth("无效的令牌"))?;
    if !token.status.is_enabled() {
        return Err(RelayError::auth("令牌已被禁用"));
    }
    if token.is_expired(now_timestamp()) {
        return Err(RelayError::auth("令牌已过期"));
    }
    if !token.unlimited && token.remain_quota <= 0 {
        return Err(RelayError::insufficient_quota("令牌额度已用尽"));
    }

    let user = repos
        .users
        .get_user(token.user_id)
        .await?
        .ok_or_else(|| RelayError::auth("令牌所属用户不存在"))?;
    if !user.status.is_enabled() {
        return Err(RelayError::auth("用户已被禁用"));
    }

    let using_group = token
        .allowed_groups
        .first()
        .cloned()
        .unwrap_or_else(|| user.group.clone());
    if !token.allows_group(&using_group, &user.group) {
        return Err(RelayError::auth(format!("令牌无权使用分组 {using_group}")));
    }

    Ok(AuthContext {
        user_id: user.id,
        token_id: token.id,
        user_group: user.group,
        using_group,
        client_ip,
        token,
    })
}

/// 令牌认证中间件
pub async fn authenticate(State(state): State<ServerState>, mut request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let format = format_for_path(&path);
    let rid = new_request_id();

    let Some(secret) = extract_key(request.headers(), request.uri().query()) else {
        return ClientError::new(RelayError::auth("未提供令牌"), format, rid).into_response();
    };
    let ip = client_ip(&request);
    match resolve(state.repositories(), &secret, ip).await {
        Ok(ctx) => {
            request.extensions_mut().insert(Arc::new(ctx));
            next.run(request).await
        }
        Err(e) => {
            lwarn!(
                rid,
                LogStage::Authentication,
                LogComponent::Auth,
                "auth_rejected",
                "令牌认证失败",
                path = %path,
                error = %e
            );
            ClientError::new(e, format, rid).into_response()
        }
    }
}

/// 管理令牌校验；未配置管理令牌时接口视为不存在
pub async fn require_admin(State(state): State<ServerState>, request: Request, next: Next) -> Response {
    let rid = new_request_id();
    let Some(expected) = state.admin_token() else {
        return ClientError::new(RelayError::not_found("管理接口未启用"), RelayFormat::OpenAi, rid)
            .into_response();
    };
    let presented = extract_key(request.headers(), None);
    if presented.as_deref() != Some(expected) {
        return ClientError::new(RelayError::auth("管理令牌无效"), RelayFormat::OpenAi, rid).into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_hash_key_is_sha256_hex() {
        assert_eq!(
            hash_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(hash_key("sk-test"), hash_key("sk-test2"));
    }

    #[rstest]
    #[case("authorization", "Bearer sk-abc", None, Some("sk-abc"))]
    #[case("x-api-key", "sk-claude", None, Some("sk-claude"))]
    #[case("x-goog-api-key", "sk-gemini", None, Some("sk-gemini"))]
    #[case("x-unrelated", "v", Some("alt=sse&key=sk-query"), Some("sk-query"))]
    #[case("sec-websocket-protocol", "realtime, openai-insecure-api-key.sk-ws", None, Some("sk-ws"))]
    #[case("x-unrelated", "v", Some("alt=sse"), None)]
    fn test_extract_key_sources(
        #[case] name: &'static str,
        #[case] value: &'static str,
        #[case] query: Option<&str>,
        #[case] expected: Option<&str>,
    ) {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_static(value));
        assert_eq!(extract_key(&headers, query).as_deref(), expected);
    }

    #[rstest]
    #[case("/v1/messages", RelayFormat::Claude)]
    #[case("/v1beta/models/gemini-pro:generateContent", RelayFormat::Gemini)]
    #[case("/v1/chat/completions", RelayFormat::OpenAi)]
    fn test_format_for_path(#[case] path: &str, #[case] expected: RelayFormat) {
        assert_eq!(format_for_path(path), expected);
    }
}
