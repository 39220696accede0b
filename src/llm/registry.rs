//! Provider selection and service construction

use super::gemini::{GeminiService, GEMINI_BASE_URL};
use super::openai::{OpenAIService, OPENAI_BASE_URL};
use super::{LlmError, LlmService, LoggingService};
use crate::accounting::Pricing;
use crate::config::{parse_var, ConfigError};
use std::sync::Arc;

pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://host.docker.internal:11434";
const DEFAULT_TEMPERATURE: f32 = 0.1;

/// Model provider. Decides the wire format and which usage adapter applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Gemini,
    OpenAI,
    Ollama,
}

impl Provider {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Some(Self::Gemini),
            "openai" => Some(Self::OpenAI),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Gemini => "Google Gemini",
            Self::OpenAI => "OpenAI",
            Self::Ollama => "Ollama",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::Gemini => "gemini-2.0-flash-001",
            Self::OpenAI => "gpt-4o-mini",
            Self::Ollama => "qwen2.5:3b",
        }
    }

    /// Unit prices per million tokens when none are configured
    pub fn default_pricing(self) -> Pricing {
        match self {
            Self::Gemini => Pricing::new(0.075, 0.30),
            Self::OpenAI | Self::Ollama => Pricing::default(),
        }
    }
}

/// Configuration for the model backend
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: Provider,
    pub model: String,
    pub google_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub ollama_base_url: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl LlmConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Without `LLM_PROVIDER`, Gemini
    /// is chosen when a Google key is present and Ollama otherwise.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let google_api_key = lookup("GOOGLE_API_KEY").filter(|k| !k.is_empty());
        let openai_api_key = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty());

        let provider = match lookup("LLM_PROVIDER") {
            Some(raw) => Provider::parse(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "LLM_PROVIDER",
                value: raw,
                reason: "expected gemini, openai or ollama".to_string(),
            })?,
            None if google_api_key.is_some() => Provider::Gemini,
            None => Provider::Ollama,
        };

        match provider {
            Provider::Gemini if google_api_key.is_none() => {
                return Err(ConfigError::Missing("GOOGLE_API_KEY"));
            }
            Provider::OpenAI if openai_api_key.is_none() => {
                return Err(ConfigError::Missing("OPENAI_API_KEY"));
            }
            _ => {}
        }

        Ok(Self {
            provider,
            model: lookup("LLM_MODEL").unwrap_or_else(|| provider.default_model().to_string()),
            google_api_key,
            openai_api_key,
            openai_base_url: lookup("OPENAI_BASE_URL")
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            ollama_base_url: lookup("OLLAMA_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OLLAMA_BASE_URL.to_string()),
            temperature: parse_var(&lookup, "LLM_TEMPERATURE")?.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: parse_var(&lookup, "LLM_MAX_TOKENS")?,
        })
    }
}

/// Build the configured model service, wrapped with request logging
pub fn create_service(config: &LlmConfig) -> Result<Arc<dyn LlmService>, LlmError> {
    let temperature = Some(config.temperature);
    let service: Arc<dyn LlmService> = match config.provider {
        Provider::Gemini => {
            let key = config
                .google_api_key
                .clone()
                .ok_or_else(|| LlmError::auth("GOOGLE_API_KEY is not set"))?;
            Arc::new(GeminiService::new(
                key,
                &config.model,
                GEMINI_BASE_URL,
                temperature,
            )?)
        }
        Provider::OpenAI => Arc::new(OpenAIService::new(
            config.openai_api_key.clone(),
            &config.model,
            &config.openai_base_url,
            temperature,
        )?),
        Provider::Ollama => Arc::new(OpenAIService::new(
            None,
            &config.model,
            &format!("{}/v1", config.ollama_base_url.trim_end_matches('/')),
            temperature,
        )?),
    };

    Ok(Arc::new(LoggingService::new(service)))
}
