//! HTTP request handlers

use super::sse::{finished_stream, run_stream};
use super::types::{
    AgentRequest, CancelResponse, CheckpointListResponse, ErrorResponse, QueuedRunResponse,
    ResumeRequest, ServiceStatus,
};
use super::AppState;
use crate::events::{RunEvent, Subscription};
use crate::runtime::{DirectSearchAnswer, StartRunError};
use crate::state_machine::{RunOutcome, RunPhase, RunState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(service_status))
        // Run triggers
        .route("/agent/run", post(run_agent))
        .route("/agent/stream", post(stream_agent))
        .route("/search", post(direct_search))
        // Thread inspection and control
        .route("/api/runs/:thread_id", get(get_latest_checkpoint))
        .route("/api/runs/:thread_id/checkpoints", get(list_checkpoints))
        .route("/api/runs/:thread_id/stream", get(stream_run))
        .route("/api/runs/:thread_id/cancel", post(cancel_run))
        .route("/api/runs/:thread_id/resume", post(resume_run))
        .with_state(state)
}

async fn service_status(State(state): State<AppState>) -> Json<ServiceStatus> {
    Json(ServiceStatus {
        status: "ok",
        service: "research-agent",
        llm: state.runs.model_id().to_string(),
    })
}

fn require_task(task: &str) -> Result<(), AppError> {
    if task.trim().is_empty() {
        return Err(AppError::BadRequest("task must not be empty".to_string()));
    }
    Ok(())
}

// ============================================================
// Run triggers
// ============================================================

async fn run_agent(
    State(state): State<AppState>,
    Json(req): Json<AgentRequest>,
) -> Result<Json<QueuedRunResponse>, AppError> {
    require_task(&req.task)?;
    let handle = state
        .runs
        .start_run(&req.task, &req.caller(), req.max_revisions)
        .await?;

    tracing::info!(run_id = %handle.run_id, thread_id = %handle.thread_id, "Run queued");
    Ok(Json(QueuedRunResponse {
        status: "queued",
        run_id: handle.run_id,
        thread_id: handle.thread_id,
    }))
}

async fn stream_agent(
    State(state): State<AppState>,
    Json(req): Json<AgentRequest>,
) -> Result<Response, AppError> {
    require_task(&req.task)?;
    let handle = state
        .runs
        .start_run(&req.task, &req.caller(), req.max_revisions)
        .await?;
    Ok(run_stream(handle.events).into_response())
}

async fn direct_search(
    State(state): State<AppState>,
    Json(req): Json<AgentRequest>,
) -> Result<Json<DirectSearchAnswer>, AppError> {
    require_task(&req.task)?;
    let answer = state.runs.direct_search(&req.task, &req.caller()).await?;
    Ok(Json(answer))
}

// ============================================================
// Thread inspection
// ============================================================

async fn get_latest_checkpoint(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let checkpoint = state
        .runs
        .latest_checkpoint(&thread_id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("No checkpoints for {thread_id}")))?;

    serde_json::to_value(checkpoint)
        .map(Json)
        .map_err(|e| AppError::Internal(e.to_string()))
}

async fn list_checkpoints(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<CheckpointListResponse>, AppError> {
    let checkpoints = state
        .runs
        .list_checkpoints(&thread_id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    if checkpoints.is_empty() {
        return Err(AppError::NotFound(format!("No checkpoints for {thread_id}")));
    }

    Ok(Json(CheckpointListResponse {
        checkpoints: checkpoints
            .into_iter()
            .map(|c| serde_json::to_value(c).unwrap_or(Value::Null))
            .collect(),
    }))
}

/// Terminal event for a finished run's state
fn terminal_event(state: &RunState) -> Option<RunEvent> {
    match &state.phase {
        RunPhase::Terminal {
            outcome: RunOutcome::Completed,
        } => Some(RunEvent::RunCompleted {
            final_answer: state.final_answer.clone().unwrap_or_default(),
        }),
        RunPhase::Terminal {
            outcome: RunOutcome::Failed { error },
        } => Some(RunEvent::RunFailed {
            error: error.clone(),
        }),
        _ => None,
    }
}

async fn stream_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Response, AppError> {
    // A run holds its thread until its final status is reported; past its
    // terminal event the subscription replays it. Once released, the
    // terminal checkpoint is already written.
    match state.runs.subscribe(&thread_id).await {
        Some(Subscription::Live(rx)) => return Ok(run_stream(rx).into_response()),
        Some(Subscription::Finished(event)) => {
            return Ok(finished_stream(&event).into_response())
        }
        None => {}
    }

    let checkpoint = state
        .runs
        .latest_checkpoint(&thread_id)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("No run for {thread_id}")))?;

    match terminal_event(&checkpoint.state) {
        Some(event) => Ok(finished_stream(&event).into_response()),
        None => Err(AppError::Conflict(format!(
            "Run {thread_id} is not running; resume it first"
        ))),
    }
}

// ============================================================
// Thread control
// ============================================================

async fn cancel_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        ok: state.runs.cancel(&thread_id).await,
    })
}

async fn resume_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(req): Json<ResumeRequest>,
) -> Result<Json<QueuedRunResponse>, AppError> {
    require_task(&req.task)?;
    let handle = state
        .runs
        .resume_run(&thread_id, &req.task, &req.caller())
        .await?;
    Ok(Json(QueuedRunResponse {
        status: "resumed",
        run_id: handle.run_id,
        thread_id: handle.thread_id,
    }))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<StartRunError> for AppError {
    fn from(e: StartRunError) -> Self {
        match e {
            StartRunError::MissingIdentity => AppError::BadRequest(e.to_string()),
            StartRunError::NothingToResume(_) => AppError::NotFound(e.to_string()),
            StartRunError::AlreadyRunning(_) | StartRunError::AlreadyFinished(_) => {
                AppError::Conflict(e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
