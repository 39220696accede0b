//! Service configuration, read once from the environment at startup

use crate::accounting::Pricing;
use crate::llm::LlmConfig;
use crate::run_status::Identity;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8001;
pub const DEFAULT_MAX_REVISIONS: u32 = 2;
pub const DEFAULT_SEARCH_BASE_URL: &str = "https://html.duckduckgo.com/html/";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Parse an optional variable, rejecting values that do not parse
pub fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

/// Connection details for the backend-core service (runs, steps, documents)
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub url: String,
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Keep checkpoints and local run records in memory only
    pub ephemeral: bool,
    pub max_revisions: u32,
    pub llm: LlmConfig,
    pub pricing: Pricing,
    pub backend: Option<BackendConfig>,
    pub search_base_url: String,
    /// Identity attributed to runs whose caller supplies none
    pub default_identity: Option<Identity>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let llm = LlmConfig::from_lookup(&lookup)?;

        let db_path = lookup("AGENT_DB_PATH").map_or_else(
            || {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(format!("{home}/.research-agent/agent.db"))
            },
            PathBuf::from,
        );

        let defaults = llm.provider.default_pricing();
        let pricing = Pricing::new(
            parse_var(&lookup, "PRICE_INPUT_PER_MTOK")?.unwrap_or(defaults.input_per_mtok),
            parse_var(&lookup, "PRICE_OUTPUT_PER_MTOK")?.unwrap_or(defaults.output_per_mtok),
        );

        let backend = match lookup("BACKEND_CORE_URL").filter(|u| !u.is_empty()) {
            Some(url) => Some(BackendConfig {
                url: url.trim_end_matches('/').to_string(),
                secret: lookup("INTERNAL_SERVICE_SECRET")
                    .filter(|s| !s.is_empty())
                    .ok_or(ConfigError::Missing("INTERNAL_SERVICE_SECRET"))?,
            }),
            None => None,
        };

        let default_identity = match (
            lookup("AGENT_DEFAULT_USER_ID").filter(|s| !s.is_empty()),
            lookup("AGENT_DEFAULT_ORG_ID").filter(|s| !s.is_empty()),
        ) {
            (Some(user_id), Some(org_id)) => Some(Identity { user_id, org_id }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("AGENT_DEFAULT_ORG_ID")),
            (None, Some(_)) => return Err(ConfigError::Missing("AGENT_DEFAULT_USER_ID")),
        };

        Ok(Self {
            port: parse_var(&lookup, "AGENT_PORT")?.unwrap_or(DEFAULT_PORT),
            db_path,
            ephemeral: parse_var(&lookup, "AGENT_EPHEMERAL")?.unwrap_or(false),
            max_revisions: parse_var(&lookup, "AGENT_MAX_REVISIONS")?
                .unwrap_or(DEFAULT_MAX_REVISIONS),
            llm,
            pricing,
            backend,
            search_base_url: lookup("SEARCH_BASE_URL")
                .unwrap_or_else(|| DEFAULT_SEARCH_BASE_URL.to_string()),
            default_identity,
        })
    }
}
