//! # 错误响应体
//!
//! 按客户端协议渲染错误：
//! OpenAI `{error:{message,type,code}, request_id}`，
//! Claude `{type:"error", error:{type,message}, request_id}`，
//! Gemini `{error:{code,message,status}}`。

use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use crate::error::RelayError;
use crate::types::RelayFormat;

pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_SUGGESTED_RETRY_AFTER: &str = "x-suggested-retry-after";

/// Claude 可识别的错误类型
const CLAUDE_ERROR_TYPES: &[&str] = &[
    "invalid_request_error",
    "authentication_error",
    "permission_error",
    "not_found_error",
    "request_too_large",
    "rate_limit_error",
    "api_error",
    "overloaded_error",
];

/// HTTP 状态对应的 Gemini 状态名
#[must_use]
pub const fn gemini_status(status: u16) -> &'static str {
    match status {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        409 => "ABORTED",
        429 => "RESOURCE_EXHAUSTED",
        499 => "CANCELLED",
        501 => "UNIMPLEMENTED",
        503 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        _ => "INTERNAL",
    }
}

fn claude_type(status: u16, canonical: &str) -> &str {
    if let Some(known) = CLAUDE_ERROR_TYPES.iter().find(|t| **t == canonical) {
        return *known;
    }
    match status {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        413 => "request_too_large",
        429 => "rate_limit_error",
        503 | 529 => "overloaded_error",
        _ => "api_error",
    }
}

/// 错误响应体
#[must_use]
pub fn error_body(error: &RelayError, format: RelayFormat, request_id: &str) -> Value {
    let (status, error_type) = error.status_and_type();
    let message = error.client_message();
    match format {
        RelayFormat::OpenAi => json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": error.code(),
            },
            "request_id": request_id,
        }),
        RelayFormat::Claude => json!({
            "type": "error",
            "error": {
                "type": claude_type(status.as_u16(), &error_type),
                "message": message,
            },
            "request_id": request_id,
        }),
        RelayFormat::Gemini => json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
                "status": gemini_status(status.as_u16()),
            }
        }),
    }
}

/// 请求 id 与建议重试时间头
#[must_use]
pub fn error_headers(error: &RelayError, request_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HEADER_REQUEST_ID, value);
    }
    if let Some(secs) = error.root().retry_after() {
        headers.insert(HEADER_SUGGESTED_RETRY_AFTER, HeaderValue::from(secs));
        headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    headers
}

/// 以客户端协议渲染的错误响应
#[derive(Debug)]
pub struct ClientError {
    pub error: RelayError,
    pub format: RelayFormat,
    pub request_id: String,
}

impl ClientError {
    #[must_use]
    pub fn new(error: RelayError, format: RelayFormat, request_id: impl Into<String>) -> Self {
        Self {
            error,
            format,
            request_id: request_id.into(),
        }
    }
}

impl IntoResponse for ClientError {
    fn into_response(self) -> Response {
        let status = self.error.status_code();
        let body = error_body(&self.error, self.format, &self.request_id);
        let headers = error_headers(&self.error, &self.request_id);
        (status, headers, body.to_string()).into_response()
    }
}

/// panic 时的通用 500
#[must_use]
pub fn panic_response(format: RelayFormat, request_id: &str) -> Response {
    ClientError::new(RelayError::internal("请求处理异常中止"), format, request_id).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_openai_shape() {
        let body = error_body(&RelayError::rate_limited("too many", 60), RelayFormat::OpenAi, "req-1");
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(body["request_id"], "req-1");
    }

    #[test]
    fn test_claude_shape_maps_type() {
        let body = error_body(
            &RelayError::no_available_channel("default", "claude-x"),
            RelayFormat::Claude,
            "req-2",
        );
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "overloaded_error");
    }

    #[test]
    fn test_gemini_shape() {
        let body = error_body(&RelayError::auth("bad key"), RelayFormat::Gemini, "req-3");
        assert_eq!(body["error"]["code"], 401);
        assert_eq!(body["error"]["status"], "UNAUTHENTICATED");
        assert!(body.get("request_id").is_none());
    }

    #[test]
    fn test_headers_carry_retry_after() {
        let headers = error_headers(&RelayError::rate_limited("x", 12), "req-4");
        assert_eq!(headers[HEADER_REQUEST_ID], "req-4");
        assert_eq!(headers[HEADER_SUGGESTED_RETRY_AFTER], "12");
    }

    #[test]
    fn test_internal_message_is_generic() {
        let response = panic_response(RelayFormat::OpenAi, "req-5");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
