//! `OpenAI` and `OpenAI`-compatible provider implementation
//!
//! Ollama exposes the same chat-completions surface under `/v1`, so both
//! providers share this service and differ only in base URL and key.

use super::types::{LlmRequest, LlmResponse};
use super::usage::{self, OpenAIUsage};
use super::{LlmError, LlmService};
use crate::message::{Message, Role, ToolCall};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible chat completions service
pub struct OpenAIService {
    client: Client,
    api_key: Option<String>,
    endpoint: String,
    model_id: String,
    temperature: Option<f32>,
}

impl OpenAIService {
    /// `base_url` is the API root that `chat/completions` hangs off
    /// (`https://api.openai.com/v1`, `http://localhost:11434/v1`).
    pub fn new(
        api_key: Option<String>,
        model_id: impl Into<String>,
        base_url: &str,
        temperature: Option<f32>,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| LlmError::unknown(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model_id: model_id.into(),
            temperature,
        })
    }

    fn translate_request(&self, request: &LlmRequest) -> OpenAIRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        if !request.system.is_empty() {
            messages.push(OpenAIMessage::text("system", request.system.clone()));
        }
        messages.extend(request.messages.iter().map(translate_message));

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| OpenAITool {
                        r#type: "function".to_string(),
                        function: OpenAIFunction {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.input_schema.clone(),
                        },
                    })
                    .collect(),
            )
        };

        OpenAIRequest {
            model: self.model_id.clone(),
            messages,
            tools,
            max_tokens: request.max_tokens,
            temperature: self.temperature,
            stream: false,
        }
    }
}

/// Translate one turn. Tool turns become `role: tool` messages keyed by
/// `tool_call_id`.
fn translate_message(msg: &Message) -> OpenAIMessage {
    match msg.role {
        Role::User => OpenAIMessage::text("user", msg.content.clone()),
        Role::System => OpenAIMessage::text("system", msg.content.clone()),
        Role::Assistant => {
            let tool_calls: Vec<OpenAIToolCall> = msg
                .tool_calls
                .iter()
                .map(|c| OpenAIToolCall {
                    id: c.call_id.clone(),
                    r#type: "function".to_string(),
                    function: OpenAIFunctionCall {
                        name: c.tool_name.clone(),
                        arguments: serde_json::to_string(&c.arguments)
                            .unwrap_or_else(|_| "{}".to_string()),
                    },
                })
                .collect();
            OpenAIMessage {
                role: "assistant".to_string(),
                content: if msg.content.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(msg.content.clone())
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
            }
        }
        Role::Tool => OpenAIMessage {
            role: "tool".to_string(),
            content: Some(if msg.is_error {
                format!("Error: {}", msg.content)
            } else {
                msg.content.clone()
            }),
            tool_calls: None,
            tool_call_id: msg.tool_result_for.clone(),
        },
    }
}

fn normalize_response(resp: OpenAIResponse) -> Result<LlmResponse, LlmError> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::unknown("No choices in response"))?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .filter(|tc| !tc.function.name.is_empty())
        .map(|tc| {
            // Unparseable arguments are passed through as a string so the
            // dispatcher reports them as invalid input to the model.
            let arguments = serde_json::from_str(&tc.function.arguments)
                .unwrap_or(serde_json::Value::String(tc.function.arguments));
            ToolCall::new(tc.id, tc.function.name, arguments)
        })
        .collect();

    Ok(LlmResponse {
        text: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage: usage::from_openai(resp.usage.as_ref()),
        end_turn: choice.finish_reason.as_deref() == Some("stop"),
    })
}

#[async_trait]
impl LlmService for OpenAIService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let openai_request = self.translate_request(request);

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&openai_request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| LlmError::from_transport(&e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::network(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            let message = serde_json::from_str::<OpenAIErrorResponse>(&body)
                .map_or(body, |err| err.error.message);
            return Err(LlmError::from_status(status.as_u16(), &message));
        }

        let openai_response: OpenAIResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::unknown(format!("Failed to parse response: {e} - body: {body}"))
        })?;

        normalize_response(openai_response)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OpenAIMessage {
    fn text(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    r#type: String,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIToolCall {
    #[serde(default)]
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: OpenAIFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIError,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
}
