//! # 图片内联
//!
//! Claude 与 Gemini 只接受内联图片：URL 下载后转 base64，data URL 与裸 base64 直接解析。

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, translation_error};

/// 内联后的图片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    /// base64 编码
    pub data: String,
}

impl InlineImage {
    #[must_use]
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// 按文件头识别常见图片类型
#[must_use]
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => Some("image/png"),
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        [b'G', b'I', b'F', b'8', ..] => Some("image/gif"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("image/webp"),
        _ => None,
    }
}

/// 解析 `data:<mime>;base64,<data>`
#[must_use]
pub fn parse_data_url(url: &str) -> Option<InlineImage> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime_type = meta.strip_suffix(";base64")?;
    Some(InlineImage {
        mime_type: if mime_type.is_empty() {
            "image/png".to_string()
        } else {
            mime_type.to_string()
        },
        data: data.to_string(),
    })
}

/// 图片下载器
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: Client,
    max_bytes: usize,
    timeout: Duration,
}

impl ImageFetcher {
    #[must_use]
    pub const fn new(client: Client, max_bytes: usize, timeout: Duration) -> Self {
        Self {
            client,
            max_bytes,
            timeout,
        }
    }

    /// 把任意形式的图片引用转为内联图片
    pub async fn resolve(&self, reference: &str) -> Result<InlineImage> {
        if let Some(image) = parse_data_url(reference) {
            return Ok(image);
        }
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return self.download(reference).await;
        }
        // 裸 base64
        let head_len = reference.len().min(64) / 4 * 4;
        let head = STANDARD
            .decode(reference.get(..head_len).unwrap_or_default())
            .unwrap_or_default();
        Ok(InlineImage {
            mime_type: sniff_mime(&head).unwrap_or("image/png").to_string(),
            data: reference.to_string(),
        })
    }

    async fn download(&self, url: &str) -> Result<InlineImage> {
        let mut response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RelayError::translation(format!("图片下载失败: {e}")))?;
        if !response.status().is_success() {
            return Err(translation_error!("图片下载失败: HTTP {}", response.status()));
        }
        if response
            .content_length()
            .is_some_and(|len| len as usize > self.max_bytes)
        {
            return Err(translation_error!("图片超过大小限制 {} 字节", self.max_bytes));
        }

        let header_mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| v.starts_with("image/"));

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| RelayError::translation(format!("图片下载失败: {e}")))?
        {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(translation_error!("图片超过大小限制 {} 字节", self.max_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        let mime_type = header_mime
            .or_else(|| sniff_mime(&body).map(ToString::to_string))
            .ok_or_else(|| translation_error!("无法识别图片类型: {}", url))?;
        ldebug!(
            "system",
            LogStage::RequestModify,
            LogComponent::Adaptor,
            "image_inlined",
            "图片已下载并内联",
            bytes = body.len(),
            mime = %mime_type
        );
        Ok(InlineImage {
            mime_type,
            data: STANDARD.encode(&body),
        })
    }
}
