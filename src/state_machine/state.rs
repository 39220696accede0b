//! Run state types

use crate::message::{Message, ToolCall};
use serde::{Deserialize, Serialize};

/// Final answer used when the model ends the run with neither text nor tool
/// calls.
pub const EMPTY_ANSWER_NOTICE: &str = "I processed the task but could not generate a text response. \
Please check the logs or try rephrasing.";

/// Phase of a run.
///
/// `Acting` only exists between dispatching a batch and receiving its
/// results; checkpoints are never written while in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunPhase {
    Reasoning,
    Acting { calls: Vec<ToolCall> },
    Terminal { outcome: RunOutcome },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed { error: String },
}

/// Snapshot of one run, owned by its executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub task: String,
    pub history: Vec<Message>,
    pub revision_number: u32,
    pub max_revisions: u32,
    pub final_answer: Option<String>,
    pub phase: RunPhase,
}

impl RunState {
    /// Fresh state with the task as the opening user turn
    pub fn new(task: impl Into<String>, max_revisions: u32) -> Self {
        let task = task.into();
        Self {
            history: vec![Message::user(task.clone())],
            task,
            revision_number: 0,
            max_revisions,
            final_answer: None,
            phase: RunPhase::Reasoning,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, RunPhase::Terminal { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match &self.phase {
            RunPhase::Terminal {
                outcome: RunOutcome::Failed { error },
            } => Some(error),
            _ => None,
        }
    }

    /// Short label stored with checkpoints
    pub fn phase_label(&self) -> &'static str {
        match &self.phase {
            RunPhase::Reasoning => "reasoning",
            RunPhase::Acting { .. } => "acting",
            RunPhase::Terminal {
                outcome: RunOutcome::Completed,
            } => "completed",
            RunPhase::Terminal {
                outcome: RunOutcome::Failed { .. },
            } => "failed",
        }
    }
}

/// Identifiers of the run a transition belongs to
#[derive(Debug, Clone)]
pub struct RunContext {
    pub thread_id: String,
    pub run_id: String,
}

impl RunContext {
    pub fn new(thread_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
        }
    }
}
