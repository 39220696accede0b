//! Canonical token usage and the per-provider adapters that produce it
//!
//! Each provider reports usage in its own shape. The service for a provider
//! calls exactly one adapter, chosen when the service is configured.

use serde::{Deserialize, Serialize};

/// Token usage for a single model turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// `usage` block of an `OpenAI`-compatible chat completion (`OpenAI`, Ollama)
#[derive(Debug, Clone, Default, Deserialize)]
#[allow(clippy::struct_field_names)]
pub struct OpenAIUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    #[allow(dead_code)] // Part of API response, not used for accounting
    pub total_tokens: u64,
}

/// `usageMetadata` block of a Gemini `generateContent` response
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiUsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    #[allow(dead_code)]
    pub total_token_count: u64,
}

pub fn from_openai(usage: Option<&OpenAIUsage>) -> Option<Usage> {
    usage.map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
}

pub fn from_gemini(metadata: Option<&GeminiUsageMetadata>) -> Option<Usage> {
    metadata.map(|m| Usage::new(m.prompt_token_count, m.candidates_token_count))
}
