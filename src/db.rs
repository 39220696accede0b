//! Database module
//!
//! Local persistence for checkpoints, and for run records when no
//! backend-core service is configured.

mod schema;

pub use schema::*;

use crate::run_status::{Identity, RunStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Run not found: {0}")]
    RunNotFound(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (ephemeral mode and tests)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Checkpoint Operations ====================

    /// Write a checkpoint for `thread_id`.
    ///
    /// A checkpoint id already stored for the thread only has its metadata
    /// refreshed; otherwise the row is appended after the thread's latest
    /// checkpoint, which becomes its parent.
    pub fn put_checkpoint(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        state: &str,
        metadata: &str,
    ) -> DbResult<CheckpointRow> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                "SELECT thread_id, checkpoint_id, parent_checkpoint_id, seq, state, metadata, created_at
                 FROM checkpoints WHERE thread_id = ?1 AND checkpoint_id = ?2",
                params![thread_id, checkpoint_id],
                parse_checkpoint_row,
            )
            .optional()?;

        if let Some(mut row) = existing {
            tx.execute(
                "UPDATE checkpoints SET metadata = ?3 WHERE thread_id = ?1 AND checkpoint_id = ?2",
                params![thread_id, checkpoint_id, metadata],
            )?;
            tx.commit()?;
            row.metadata = metadata.to_string();
            return Ok(row);
        }

        let latest: Option<(String, i64)> = tx
            .query_row(
                "SELECT checkpoint_id, seq FROM checkpoints WHERE thread_id = ?1
                 ORDER BY seq DESC LIMIT 1",
                params![thread_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (parent_checkpoint_id, seq) = match latest {
            Some((id, seq)) => (Some(id), seq + 1),
            None => (None, 0),
        };

        let now = Utc::now();
        tx.execute(
            "INSERT INTO checkpoints (thread_id, checkpoint_id, parent_checkpoint_id, seq, state, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                thread_id,
                checkpoint_id,
                parent_checkpoint_id,
                seq,
                state,
                metadata,
                now.to_rfc3339()
            ],
        )?;
        tx.commit()?;

        Ok(CheckpointRow {
            thread_id: thread_id.to_string(),
            checkpoint_id: checkpoint_id.to_string(),
            parent_checkpoint_id,
            seq,
            state: state.to_string(),
            metadata: metadata.to_string(),
            created_at: now,
        })
    }

    /// Most recent checkpoint for a thread
    pub fn latest_checkpoint(&self, thread_id: &str) -> DbResult<Option<CheckpointRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT thread_id, checkpoint_id, parent_checkpoint_id, seq, state, metadata, created_at
             FROM checkpoints WHERE thread_id = ?1 ORDER BY seq DESC LIMIT 1",
            params![thread_id],
            parse_checkpoint_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    /// All checkpoints for a thread, oldest first
    pub fn list_checkpoints(&self, thread_id: &str) -> DbResult<Vec<CheckpointRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT thread_id, checkpoint_id, parent_checkpoint_id, seq, state, metadata, created_at
             FROM checkpoints WHERE thread_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![thread_id], parse_checkpoint_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ==================== Run Operations ====================

    pub fn create_run(
        &self,
        id: &str,
        identity: &Identity,
        agent_type: &str,
        input_params: &Value,
    ) -> DbResult<RunRecord> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO runs (id, organization_id, user_id, agent_type, input_params, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                id,
                identity.org_id,
                identity.user_id,
                agent_type,
                input_params.to_string(),
                RunStatus::Queued.as_str(),
                now.to_rfc3339()
            ],
        )?;

        Ok(RunRecord {
            id: id.to_string(),
            organization_id: identity.org_id.clone(),
            user_id: identity.user_id.clone(),
            agent_type: agent_type.to_string(),
            input_params: input_params.clone(),
            output_result: None,
            status: RunStatus::Queued.as_str().to_string(),
            error_message: None,
            cost_usd: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Update a run's status; `None` fields keep their stored value
    pub fn update_run(
        &self,
        id: &str,
        status: RunStatus,
        output_result: Option<&Value>,
        cost_usd: Option<f64>,
        error_message: Option<&str>,
    ) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE runs SET status = ?2,
                    output_result = COALESCE(?3, output_result),
                    cost_usd = COALESCE(?4, cost_usd),
                    error_message = COALESCE(?5, error_message),
                    updated_at = ?6
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                output_result.map(Value::to_string),
                cost_usd,
                error_message,
                Utc::now().to_rfc3339()
            ],
        )?;
        if updated == 0 {
            return Err(DbError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> DbResult<RunRecord> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, organization_id, user_id, agent_type, input_params, output_result, status,
                    error_message, cost_usd, created_at, updated_at
             FROM runs WHERE id = ?1",
            params![id],
            |row| {
                Ok(RunRecord {
                    id: row.get(0)?,
                    organization_id: row.get(1)?,
                    user_id: row.get(2)?,
                    agent_type: row.get(3)?,
                    input_params: parse_json(&row.get::<_, String>(4)?),
                    output_result: row.get::<_, Option<String>>(5)?.map(|s| parse_json(&s)),
                    status: row.get(6)?,
                    error_message: row.get(7)?,
                    cost_usd: row.get(8)?,
                    created_at: parse_datetime(&row.get::<_, String>(9)?),
                    updated_at: parse_datetime(&row.get::<_, String>(10)?),
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::RunNotFound(id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    pub fn add_run_step(
        &self,
        run_id: &str,
        step_type: &str,
        content: &Value,
        usage_tokens: Option<i64>,
    ) -> DbResult<RunStepRecord> {
        let conn = self.conn.lock().unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO run_steps (id, run_id, step_type, content, usage_tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, run_id, step_type, content.to_string(), usage_tokens, now.to_rfc3339()],
        )?;
        Ok(RunStepRecord {
            id,
            run_id: run_id.to_string(),
            step_type: step_type.to_string(),
            content: content.clone(),
            usage_tokens,
            created_at: now,
        })
    }

    pub fn get_run_steps(&self, run_id: &str) -> DbResult<Vec<RunStepRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, step_type, content, usage_tokens, created_at
             FROM run_steps WHERE run_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let steps = stmt
            .query_map(params![run_id], |row| {
                Ok(RunStepRecord {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    step_type: row.get(2)?,
                    content: parse_json(&row.get::<_, String>(3)?),
                    usage_tokens: row.get(4)?,
                    created_at: parse_datetime(&row.get::<_, String>(5)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(steps)
    }
}

fn parse_checkpoint_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRow> {
    Ok(CheckpointRow {
        thread_id: row.get(0)?,
        checkpoint_id: row.get(1)?,
        parent_checkpoint_id: row.get(2)?,
        seq: row.get(3)?,
        state: row.get(4)?,
        metadata: row.get(5)?,
        created_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

fn parse_json(s: &str) -> Value {
    serde_json::from_str(s).unwrap_or_default()
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
