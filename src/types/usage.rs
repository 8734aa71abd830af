//! # 规范化的用量

use serde::{Deserialize, Serialize};

/// 以 OpenAI 口径统计的 token 用量
///
/// `prompt_tokens` 包含缓存命中与缓存写入部分，计费时再拆分。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub audio_prompt_tokens: u64,
    #[serde(default)]
    pub audio_completion_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
}

impl Usage {
    #[must_use]
    pub const fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cached_tokens: 0,
            cache_creation_tokens: 0,
            audio_prompt_tokens: 0,
            audio_completion_tokens: 0,
            reasoning_tokens: 0,
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }

    /// 补全缺失的 total
    pub fn normalize(&mut self) {
        let sum = self.prompt_tokens + self.completion_tokens;
        if self.total_tokens < sum {
            self.total_tokens = sum;
        }
    }

    /// 不含缓存部分的文本输入 token
    #[must_use]
    pub const fn uncached_prompt_tokens(&self) -> u64 {
        self.prompt_tokens
            .saturating_sub(self.cached_tokens)
            .saturating_sub(self.cache_creation_tokens)
            .saturating_sub(self.audio_prompt_tokens)
    }

    /// 纯文本补全 token
    #[must_use]
    pub const fn text_completion_tokens(&self) -> u64 {
        self.completion_tokens.saturating_sub(self.audio_completion_tokens)
    }

    /// 合并流式过程中后到达的用量，非零字段覆盖
    pub fn merge(&mut self, other: &Self) {
        macro_rules! take {
            ($($field:ident),*) => {
                $( if other.$field > 0 { self.$field = other.$field; } )*
            };
        }
        take!(
            prompt_tokens,
            completion_tokens,
            total_tokens,
            cached_tokens,
            cache_creation_tokens,
            audio_prompt_tokens,
            audio_completion_tokens,
            reasoning_tokens
        );
        self.normalize();
    }
}
