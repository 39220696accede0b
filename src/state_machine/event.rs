//! Events that drive a run

use crate::message::{Message, ToolResult};

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    /// Begin (or resume) execution from the current state
    Start,

    // Model events
    /// The model returned one assistant turn, call ids already assigned
    ModelResponded { message: Message },
    ModelFailed { error: String },

    // Tool events
    ToolsCompleted { results: Vec<ToolResult> },

    /// Cancellation was requested
    Cancelled,
    /// Protocol violation detected outside the transition function
    Fatal { error: String },
}
