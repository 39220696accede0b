//! Common types for LLM interactions

use super::Usage;
use crate::message::{Message, ToolCall};

/// LLM request
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
}

/// Tool definition advertised to the model
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// LLM response, already translated out of the provider's wire format
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub text: String,
    /// Tool calls in the order the model requested them. Providers that do
    /// not assign call ids leave `call_id` empty.
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub end_turn: bool,
}

impl LlmResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            usage: None,
            end_turn: true,
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            text: String::new(),
            tool_calls: calls,
            usage: None,
            end_turn: false,
        }
    }

    #[must_use]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}
