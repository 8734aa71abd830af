//! # 转发相关的基础枚举

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 客户端期望的协议格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayFormat {
    OpenAi,
    Claude,
    Gemini,
}

impl RelayFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Claude => "claude",
            Self::Gemini => "gemini",
        }
    }
}

impl fmt::Display for RelayFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 请求所属的逻辑端点族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    Chat,
    Completion,
    Embedding,
    ImageGenerate,
    ImageEdit,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    Rerank,
    Realtime,
    Responses,
    TaskSubmit,
    TaskFetch,
}

impl RelayMode {
    /// 根据请求路径识别模式
    #[must_use]
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or(path);
        let mode = match path {
            "/v1/chat/completions" | "/v1/messages" => Self::Chat,
            "/v1/completions" => Self::Completion,
            "/v1/embeddings" => Self::Embedding,
            "/v1/images/generations" => Self::ImageGenerate,
            "/v1/images/edits" => Self::ImageEdit,
            "/v1/audio/speech" => Self::AudioSpeech,
            "/v1/audio/transcriptions" => Self::AudioTranscription,
            "/v1/audio/translations" => Self::AudioTranslation,
            "/v1/rerank" => Self::Rerank,
            "/v1/realtime" => Self::Realtime,
            "/v1/responses" => Self::Responses,
            p if p.starts_with("/v1beta/models/") => {
                let action = p.rsplit(':').next().unwrap_or_default();
                if action.contains("mbed") {
                    Self::Embedding
                } else {
                    Self::Chat
                }
            }
            p if p.ends_with("/submit") => Self::TaskSubmit,
            p if p.ends_with("/fetch") || p.ends_with("/task/list-by-condition") => Self::TaskFetch,
            _ => return None,
        };
        Some(mode)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Completion => "completion",
            Self::Embedding => "embedding",
            Self::ImageGenerate => "image_generate",
            Self::ImageEdit => "image_edit",
            Self::AudioSpeech => "audio_speech",
            Self::AudioTranscription => "audio_transcription",
            Self::AudioTranslation => "audio_translation",
            Self::Rerank => "rerank",
            Self::Realtime => "realtime",
            Self::Responses => "responses",
            Self::TaskSubmit => "task_submit",
            Self::TaskFetch => "task_fetch",
        }
    }

    /// 请求体是否为 multipart/form-data
    #[must_use]
    pub const fn is_multipart(self) -> bool {
        matches!(
            self,
            Self::ImageEdit | Self::AudioTranscription | Self::AudioTranslation
        )
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 上游服务商类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(alias = "claude")]
    Anthropic,
    Gemini,
    /// 异步任务平台（提交/轮询）
    Task,
}

impl ProviderKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Task => "task",
        }
    }

    /// 上游原生协议格式
    #[must_use]
    pub const fn native_format(self) -> RelayFormat {
        match self {
            Self::OpenAi | Self::Task => RelayFormat::OpenAi,
            Self::Anthropic => RelayFormat::Claude,
            Self::Gemini => RelayFormat::Gemini,
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" | "azure" | "openai_compatible" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "gemini" | "google" => Ok(Self::Gemini),
            "task" => Ok(Self::Task),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
