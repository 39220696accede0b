//! Database schema and row types

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS checkpoints (
    thread_id TEXT NOT NULL,
    checkpoint_id TEXT NOT NULL,
    parent_checkpoint_id TEXT,
    seq INTEGER NOT NULL,
    state TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (thread_id, checkpoint_id)
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_thread_seq ON checkpoints(thread_id, seq DESC);

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    agent_type TEXT NOT NULL,
    input_params TEXT NOT NULL,
    output_result TEXT,
    status TEXT NOT NULL,
    error_message TEXT,
    cost_usd REAL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS run_steps (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    step_type TEXT NOT NULL,
    content TEXT NOT NULL,
    usage_tokens INTEGER,
    created_at TEXT NOT NULL,

    FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_run_steps_run ON run_steps(run_id, created_at);
";

/// Stored checkpoint row; `state` and `metadata` stay serialized here
#[derive(Debug, Clone)]
pub struct CheckpointRow {
    pub thread_id: String,
    pub checkpoint_id: String,
    pub parent_checkpoint_id: Option<String>,
    pub seq: i64,
    pub state: String,
    pub metadata: String,
    pub created_at: DateTime<Utc>,
}

/// Run record, as kept when no backend-core is configured
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub agent_type: String,
    pub input_params: Value,
    pub output_result: Option<Value>,
    pub status: String,
    pub error_message: Option<String>,
    pub cost_usd: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStepRecord {
    pub id: String,
    pub run_id: String,
    pub step_type: String,
    pub content: Value,
    pub usage_tokens: Option<i64>,
    pub created_at: DateTime<Utc>,
}
