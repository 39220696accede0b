//! API request and response types

use crate::run_status::CallerContext;
use serde::{Deserialize, Serialize};

/// Body of `/agent/run`, `/agent/stream` and `/search`
#[derive(Debug, Deserialize)]
pub struct AgentRequest {
    pub task: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub max_revisions: Option<u32>,
}

impl AgentRequest {
    pub fn caller(&self) -> CallerContext {
        CallerContext {
            user_id: self.user_id.clone(),
            org_id: self.org_id.clone(),
        }
    }
}

/// Body of `/api/runs/:thread_id/resume`
#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    pub task: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
}

impl ResumeRequest {
    pub fn caller(&self) -> CallerContext {
        CallerContext {
            user_id: self.user_id.clone(),
            org_id: self.org_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub status: &'static str,
    pub service: &'static str,
    pub llm: String,
}

/// Response for a run that was accepted
#[derive(Debug, Serialize)]
pub struct QueuedRunResponse {
    pub status: &'static str,
    pub run_id: String,
    pub thread_id: String,
}

#[derive(Debug, Serialize)]
pub struct CheckpointListResponse {
    pub checkpoints: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub ok: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
