//! Runtime for executing runs
//!
//! Every run is one spawned task owning its state. The manager keeps a
//! handle per live thread so callers can stream, cancel or resume it.

mod executor;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::{ExecutorSettings, RunExecutor, RunSinks};
pub use traits::*;

use crate::accounting::Pricing;
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::events::{EventBus, RunChannel, RunEvent, Subscription};
use crate::run_status::{
    CallerContext, Identity, NewRun, RunStatusSink, StatusUpdate, AGENT_TYPE_DIRECT_SEARCH,
    AGENT_TYPE_RESEARCHER,
};
use crate::state_machine::{RunContext, RunState};
use crate::tools::{format_direct_answer, MemoryClient, MemoryError};
use serde::Serialize;
use serde_json::json;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

/// Type alias for the executor used in production
pub type ProductionExecutor = RunExecutor<dyn LlmClient, dyn ToolExecutor>;

/// Settings applied to every run the manager starts
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub system_prompt: String,
    pub pricing: Pricing,
    pub max_tokens: Option<u32>,
    pub default_max_revisions: u32,
    pub default_identity: Option<Identity>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartRunError {
    #[error("user_id and org_id are required (no default identity is configured)")]
    MissingIdentity,
    #[error("Run {0} is already in progress")]
    AlreadyRunning(String),
    #[error("Run {0} has already finished")]
    AlreadyFinished(String),
    #[error("No checkpoint found for {0}")]
    NothingToResume(String),
}

/// Handle returned to the caller that started a run
pub struct RunHandle {
    pub run_id: String,
    pub thread_id: String,
    /// Subscribed before the executor starts, so no event is missed
    pub events: broadcast::Receiver<RunEvent>,
}

/// Result of a direct knowledge-base search
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectSearchAnswer {
    pub status: &'static str,
    pub answer: String,
    pub run_id: String,
}

/// A thread's slot in the active map. Taken before any I/O, so a thread
/// never has two executors.
#[derive(Clone)]
struct ActiveRun {
    channel: RunChannel,
    cancel: CancellationToken,
}

/// Manager for all runs
pub struct RunManager {
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolExecutor>,
    sinks: RunSinks,
    settings: RunSettings,
    memory: Option<Arc<MemoryClient>>,
    active: Arc<RwLock<HashMap<String, ActiveRun>>>,
}

impl RunManager {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolExecutor>,
        sinks: RunSinks,
        settings: RunSettings,
    ) -> Self {
        Self {
            llm,
            tools,
            sinks,
            settings,
            memory: None,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Memory client used by direct search
    #[must_use]
    pub fn with_memory(mut self, memory: Option<Arc<MemoryClient>>) -> Self {
        self.memory = memory;
        self
    }

    pub fn model_id(&self) -> &str {
        self.llm.model_id()
    }

    fn identity(&self, caller: &CallerContext) -> Result<Identity, StartRunError> {
        caller
            .resolve(self.settings.default_identity.as_ref())
            .ok_or(StartRunError::MissingIdentity)
    }

    /// Start a fresh run on a new thread
    pub async fn start_run(
        &self,
        task: &str,
        caller: &CallerContext,
        max_revisions: Option<u32>,
    ) -> Result<RunHandle, StartRunError> {
        let identity = self.identity(caller)?;
        let thread_id = uuid::Uuid::new_v4().to_string();
        let slot = self.reserve(&thread_id).await?;
        let state = RunState::new(
            task,
            max_revisions.unwrap_or(self.settings.default_max_revisions),
        );
        Ok(self.launch(thread_id, state, identity, slot).await)
    }

    /// Continue a thread from its latest checkpoint.
    ///
    /// An unreadable checkpoint starts the thread over from `task`.
    pub async fn resume_run(
        &self,
        thread_id: &str,
        task: &str,
        caller: &CallerContext,
    ) -> Result<RunHandle, StartRunError> {
        let identity = self.identity(caller)?;
        let slot = self.reserve(thread_id).await?;

        let state = match self.sinks.checkpoints.load_latest(thread_id).await {
            Ok(Some(checkpoint)) if checkpoint.state.is_terminal() => {
                Err(StartRunError::AlreadyFinished(thread_id.to_string()))
            }
            Ok(Some(checkpoint)) => Ok(checkpoint.state),
            Ok(None) => Err(StartRunError::NothingToResume(thread_id.to_string())),
            Err(e) => {
                tracing::warn!(thread_id = %thread_id, error = %e, "Checkpoint unreadable, starting fresh");
                Ok(RunState::new(task, self.settings.default_max_revisions))
            }
        };
        let state = match state {
            Ok(state) => state,
            Err(e) => {
                self.active.write().await.remove(thread_id);
                return Err(e);
            }
        };

        tracing::info!(
            thread_id = %thread_id,
            revision = state.revision_number,
            "Resuming run"
        );
        Ok(self.launch(thread_id.to_string(), state, identity, slot).await)
    }

    /// Claim the thread's slot, failing if a run already holds it
    async fn reserve(&self, thread_id: &str) -> Result<ActiveRun, StartRunError> {
        match self.active.write().await.entry(thread_id.to_string()) {
            Entry::Occupied(_) => Err(StartRunError::AlreadyRunning(thread_id.to_string())),
            Entry::Vacant(slot) => {
                let run = ActiveRun {
                    channel: RunChannel::new(),
                    cancel: CancellationToken::new(),
                };
                Ok(slot.insert(run).clone())
            }
        }
    }

    async fn create_run_record(&self, agent_type: &'static str, task: &str, identity: Identity) -> String {
        let new_run = NewRun {
            agent_type,
            task: task.to_string(),
            identity,
        };
        match self.sinks.status.create_run(&new_run).await {
            Ok(id) => id,
            Err(e) => {
                let id = uuid::Uuid::new_v4().to_string();
                tracing::warn!(run_id = %id, error = %e, "Run record not created, using local id");
                id
            }
        }
    }

    async fn launch(
        &self,
        thread_id: String,
        state: RunState,
        identity: Identity,
        slot: ActiveRun,
    ) -> RunHandle {
        let events = slot.channel.receiver();
        let run_id = self
            .create_run_record(AGENT_TYPE_RESEARCHER, &state.task, identity)
            .await;

        let executor: ProductionExecutor = RunExecutor::new(
            RunContext::new(&thread_id, &run_id),
            state,
            self.llm.clone(),
            self.tools.clone(),
            self.sinks.clone(),
            EventBus::new(slot.channel),
            slot.cancel,
            ExecutorSettings {
                system_prompt: self.settings.system_prompt.clone(),
                pricing: self.settings.pricing,
                max_tokens: self.settings.max_tokens,
            },
        );

        let active = self.active.clone();
        let finished_thread = thread_id.clone();
        tokio::spawn(async move {
            executor.run().await;
            active.write().await.remove(&finished_thread);
            tracing::debug!(thread_id = %finished_thread, "Run task exited");
        });

        RunHandle {
            run_id,
            thread_id,
            events,
        }
    }

    /// Request cancellation of a live run. Returns false when the thread has
    /// no run in progress.
    pub async fn cancel(&self, thread_id: &str) -> bool {
        match self.active.read().await.get(thread_id) {
            Some(run) => {
                tracing::info!(thread_id = %thread_id, "Cancelling run");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Subscribe to a live run's events. A run that has emitted its terminal
    /// event but not yet released the thread replays that event instead.
    pub async fn subscribe(&self, thread_id: &str) -> Option<Subscription> {
        self.active
            .read()
            .await
            .get(thread_id)
            .map(|run| run.channel.subscribe())
    }

    pub async fn latest_checkpoint(
        &self,
        thread_id: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        self.sinks.checkpoints.load_latest(thread_id).await
    }

    pub async fn list_checkpoints(&self, thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        self.sinks.checkpoints.list(thread_id).await
    }

    /// Answer straight from the knowledge base without involving the model
    pub async fn direct_search(
        &self,
        task: &str,
        caller: &CallerContext,
    ) -> Result<DirectSearchAnswer, StartRunError> {
        let identity = self.identity(caller)?;
        let run_id = self
            .create_run_record(AGENT_TYPE_DIRECT_SEARCH, task, identity)
            .await;
        self.report(&run_id, &StatusUpdate::running()).await;

        let outcome = match &self.memory {
            Some(memory) => memory.search(task).await,
            None => Err(MemoryError::NotConfigured),
        };

        let (status, answer, update) = match outcome {
            Ok(hits) => {
                let answer = format_direct_answer(&hits);
                let update = StatusUpdate::completed(json!({ "response": answer }), 0.0);
                ("success", answer, update)
            }
            Err(MemoryError::Status { status, .. }) => {
                let answer = format!("Search failed: {status}");
                let update = StatusUpdate::failed(&answer);
                ("error", answer, update)
            }
            Err(e) => {
                let answer = format!("Error: {e}");
                let update = StatusUpdate::failed(&answer);
                ("error", answer, update)
            }
        };
        self.report(&run_id, &update).await;

        tracing::info!(run_id = %run_id, status, "Direct search finished");
        Ok(DirectSearchAnswer {
            status,
            answer,
            run_id,
        })
    }

    async fn report(&self, run_id: &str, update: &StatusUpdate) {
        if let Err(e) = self.sinks.status.update_status(run_id, update).await {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to report run status");
        }
    }
}
