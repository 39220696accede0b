//! Run status reporting
//!
//! Each run is tracked by an external record that moves through
//! `QUEUED -> RUNNING -> COMPLETED | FAILED`. The record lives in backend-core
//! when one is configured, otherwise in the local database.

use crate::config::BackendConfig;
use crate::db::{Database, DbError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const AGENT_TYPE_RESEARCHER: &str = "RESEARCHER";
pub const AGENT_TYPE_DIRECT_SEARCH: &str = "DIRECT_SEARCH";

const BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }
}

/// User and organization a run is attributed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub org_id: String,
}

/// Identity fields supplied by the caller, possibly partial
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallerContext {
    pub user_id: Option<String>,
    pub org_id: Option<String>,
}

impl CallerContext {
    /// Fill missing fields from the configured default. `None` when neither
    /// source provides both halves.
    pub fn resolve(&self, default: Option<&Identity>) -> Option<Identity> {
        let pick = |given: &Option<String>, fallback: Option<&String>| {
            given
                .as_ref()
                .filter(|s| !s.is_empty())
                .or(fallback)
                .cloned()
        };
        Some(Identity {
            user_id: pick(&self.user_id, default.map(|d| &d.user_id))?,
            org_id: pick(&self.org_id, default.map(|d| &d.org_id))?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub agent_type: &'static str,
    pub task: String,
    pub identity: Identity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: RunStatus,
    pub output_result: Option<Value>,
    pub cost_usd: Option<f64>,
    pub error_message: Option<String>,
}

impl StatusUpdate {
    pub fn running() -> Self {
        Self {
            status: RunStatus::Running,
            output_result: None,
            cost_usd: None,
            error_message: None,
        }
    }

    pub fn completed(output_result: Value, cost_usd: f64) -> Self {
        Self {
            status: RunStatus::Completed,
            output_result: Some(output_result),
            cost_usd: Some(cost_usd),
            error_message: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            status: RunStatus::Failed,
            output_result: Some(json!({ "error": error })),
            cost_usd: None,
            error_message: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub step_type: String,
    pub content: Value,
}

impl StepRecord {
    pub fn tool_call(tool: &str, output: &str) -> Self {
        Self {
            step_type: "tool_call".to_string(),
            content: json!({ "tool": tool, "output": output }),
        }
    }
}

#[derive(Debug, Error)]
pub enum StatusSinkError {
    #[error("Backend request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Backend rejected request: {status} {body}")]
    Rejected { status: u16, body: String },
    #[error("Backend response carried no run id")]
    MissingId,
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("Status task failed: {0}")]
    Task(String),
}

/// Where run lifecycle transitions are reported
#[async_trait]
pub trait RunStatusSink: Send + Sync {
    /// Create a `QUEUED` run record and return its id
    async fn create_run(&self, run: &NewRun) -> Result<String, StatusSinkError>;

    async fn update_status(&self, run_id: &str, update: &StatusUpdate)
        -> Result<(), StatusSinkError>;

    async fn log_step(&self, run_id: &str, step: &StepRecord) -> Result<(), StatusSinkError>;
}

#[async_trait]
impl<T: RunStatusSink + ?Sized> RunStatusSink for Arc<T> {
    async fn create_run(&self, run: &NewRun) -> Result<String, StatusSinkError> {
        (**self).create_run(run).await
    }

    async fn update_status(
        &self,
        run_id: &str,
        update: &StatusUpdate,
    ) -> Result<(), StatusSinkError> {
        (**self).update_status(run_id, update).await
    }

    async fn log_step(&self, run_id: &str, step: &StepRecord) -> Result<(), StatusSinkError> {
        (**self).log_step(run_id, step).await
    }
}

// ============================================================================
// backend-core REST
// ============================================================================

pub struct HttpRunStatusSink {
    client: reqwest::Client,
    base_url: String,
    secret: String,
}

impl HttpRunStatusSink {
    pub fn new(config: &BackendConfig) -> Result<Self, StatusSinkError> {
        let client = reqwest::Client::builder()
            .timeout(BACKEND_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.clone(),
            secret: config.secret.clone(),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, StatusSinkError> {
        let response = request.header("X-Internal-Secret", &self.secret).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(StatusSinkError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl RunStatusSink for HttpRunStatusSink {
    async fn create_run(&self, run: &NewRun) -> Result<String, StatusSinkError> {
        let payload = json!({
            "agent_type": run.agent_type,
            "input_params": { "task": run.task },
            "status": RunStatus::Queued,
            "user": run.identity.user_id,
            "organization": run.identity.org_id,
        });
        let url = format!("{}/runs/", self.base_url);
        let body: Value = self.send(self.client.post(url).json(&payload)).await?.json().await?;
        match &body["id"] {
            Value::String(id) => Ok(id.clone()),
            Value::Number(n) => Ok(n.to_string()),
            _ => Err(StatusSinkError::MissingId),
        }
    }

    async fn update_status(
        &self,
        run_id: &str,
        update: &StatusUpdate,
    ) -> Result<(), StatusSinkError> {
        let mut payload = json!({ "status": update.status });
        if let Some(result) = &update.output_result {
            payload["output_result"] = result.clone();
        }
        if let Some(cost) = update.cost_usd {
            payload["cost_usd"] = json!(cost);
        }
        if let Some(error) = &update.error_message {
            payload["error_message"] = json!(error);
        }
        let url = format!("{}/runs/{run_id}/", self.base_url);
        self.send(self.client.patch(url).json(&payload)).await?;
        Ok(())
    }

    async fn log_step(&self, run_id: &str, step: &StepRecord) -> Result<(), StatusSinkError> {
        let payload = json!({
            "run": run_id,
            "step_type": step.step_type,
            "content": step.content,
        });
        let url = format!("{}/steps/", self.base_url);
        self.send(self.client.post(url).json(&payload)).await?;
        Ok(())
    }
}

// ============================================================================
// Local database
// ============================================================================

async fn blocking<T, F>(f: F) -> Result<T, StatusSinkError>
where
    F: FnOnce() -> Result<T, DbError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StatusSinkError::Task(e.to_string()))?
        .map_err(StatusSinkError::from)
}

#[async_trait]
impl RunStatusSink for Database {
    async fn create_run(&self, run: &NewRun) -> Result<String, StatusSinkError> {
        let db = self.clone();
        let run = run.clone();
        blocking(move || {
            let id = uuid::Uuid::new_v4().to_string();
            db.create_run(&id, &run.identity, run.agent_type, &json!({ "task": run.task }))?;
            Ok(id)
        })
        .await
    }

    async fn update_status(
        &self,
        run_id: &str,
        update: &StatusUpdate,
    ) -> Result<(), StatusSinkError> {
        let db = self.clone();
        let run_id = run_id.to_string();
        let update = update.clone();
        blocking(move || {
            db.update_run(
                &run_id,
                update.status,
                update.output_result.as_ref(),
                update.cost_usd,
                update.error_message.as_deref(),
            )
        })
        .await
    }

    async fn log_step(&self, run_id: &str, step: &StepRecord) -> Result<(), StatusSinkError> {
        let db = self.clone();
        let run_id = run_id.to_string();
        let step = step.clone();
        blocking(move || {
            db.add_run_step(&run_id, &step.step_type, &step.content, None)?;
            Ok(())
        })
        .await
    }
}
