//! Checkpoint persistence
//!
//! A checkpoint is a snapshot of a [`RunState`] keyed by `(thread_id,
//! checkpoint_id)`. The id is the SHA-256 of the serialized state, so saving
//! the same state twice is an upsert rather than a second checkpoint.

use crate::db::{CheckpointRow, Database, DbError};
use crate::state_machine::RunState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("Checkpoint task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub run_id: String,
    pub revision: u32,
    pub phase: String,
}

impl CheckpointMetadata {
    fn for_state(run_id: &str, state: &RunState) -> Self {
        Self {
            run_id: run_id.to_string(),
            revision: state.revision_number,
            phase: state.phase_label().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub checkpoint_id: String,
    pub parent_checkpoint_id: Option<String>,
    pub seq: i64,
    pub state: RunState,
    pub metadata: CheckpointMetadata,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<CheckpointRow> for Checkpoint {
    type Error = CheckpointError;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        Ok(Self {
            state: serde_json::from_str(&row.state)?,
            metadata: serde_json::from_str(&row.metadata)?,
            thread_id: row.thread_id,
            checkpoint_id: row.checkpoint_id,
            parent_checkpoint_id: row.parent_checkpoint_id,
            seq: row.seq,
            created_at: row.created_at,
        })
    }
}

/// Content-derived checkpoint id (lowercase hex SHA-256)
pub fn checkpoint_id(serialized_state: &str) -> String {
    format!("{:x}", Sha256::digest(serialized_state.as_bytes()))
}

/// Durable store of run snapshots
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Save `state` for `thread_id`, returning its checkpoint id
    async fn save(
        &self,
        thread_id: &str,
        run_id: &str,
        state: &RunState,
    ) -> Result<String, CheckpointError>;

    /// Most recent checkpoint for the thread
    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Every checkpoint for the thread, oldest first
    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError>;
}

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for Arc<T> {
    async fn save(
        &self,
        thread_id: &str,
        run_id: &str,
        state: &RunState,
    ) -> Result<String, CheckpointError> {
        (**self).save(thread_id, run_id, state).await
    }

    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        (**self).load_latest(thread_id).await
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        (**self).list(thread_id).await
    }
}

// ============================================================================
// SQLite
// ============================================================================

async fn blocking<T, F>(f: F) -> Result<T, CheckpointError>
where
    F: FnOnce() -> Result<T, CheckpointError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CheckpointError::Task(e.to_string()))?
}

#[async_trait]
impl CheckpointStore for Database {
    async fn save(
        &self,
        thread_id: &str,
        run_id: &str,
        state: &RunState,
    ) -> Result<String, CheckpointError> {
        let state_json = serde_json::to_string(state)?;
        let metadata_json = serde_json::to_string(&CheckpointMetadata::for_state(run_id, state))?;
        let id = checkpoint_id(&state_json);

        let db = self.clone();
        let thread_id = thread_id.to_string();
        let row_id = id.clone();
        blocking(move || {
            db.put_checkpoint(&thread_id, &row_id, &state_json, &metadata_json)?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let db = self.clone();
        let thread_id = thread_id.to_string();
        let row = blocking(move || Ok(db.latest_checkpoint(&thread_id)?)).await?;
        row.map(Checkpoint::try_from).transpose()
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let db = self.clone();
        let thread_id = thread_id.to_string();
        let rows = blocking(move || Ok(db.list_checkpoints(&thread_id)?)).await?;
        rows.into_iter().map(Checkpoint::try_from).collect()
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local store for ephemeral runs and tests
#[derive(Default)]
pub struct MemoryCheckpointStore {
    threads: RwLock<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(
        &self,
        thread_id: &str,
        run_id: &str,
        state: &RunState,
    ) -> Result<String, CheckpointError> {
        let id = checkpoint_id(&serde_json::to_string(state)?);
        let metadata = CheckpointMetadata::for_state(run_id, state);

        let mut threads = self.threads.write().await;
        let chain = threads.entry(thread_id.to_string()).or_default();
        if let Some(existing) = chain.iter_mut().find(|c| c.checkpoint_id == id) {
            existing.metadata = metadata;
            return Ok(id);
        }

        let parent = chain.last().map(|c| c.checkpoint_id.clone());
        let seq = chain.last().map_or(0, |c| c.seq + 1);
        chain.push(Checkpoint {
            thread_id: thread_id.to_string(),
            checkpoint_id: id.clone(),
            parent_checkpoint_id: parent,
            seq,
            state: state.clone(),
            metadata,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id).and_then(|chain| chain.last().cloned()))
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id).cloned().unwrap_or_default())
    }
}
