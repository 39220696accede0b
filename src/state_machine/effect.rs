//! Effects produced by state transitions

use crate::events::RunEvent;
use crate::message::ToolCall;

/// Effects to be executed after state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Write the new state to the checkpoint store
    PersistCheckpoint,

    /// Normalize history and call the model
    RequestModel,

    /// Run a batch of tool calls
    DispatchTools { calls: Vec<ToolCall> },

    /// Publish an event to the run's subscribers
    Emit(RunEvent),

    /// Append a step to the run's external step log
    RecordToolStep { tool_name: String, output: String },
}

impl Effect {
    pub fn emit(event: RunEvent) -> Self {
        Effect::Emit(event)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Effect::Emit(RunEvent::RunFailed {
            error: error.into(),
        })
    }
}
