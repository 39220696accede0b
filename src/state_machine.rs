//! Agent run state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions.

mod effect;
mod event;
mod state;
mod transition;

#[cfg(test)]
mod proptests;

pub use effect::Effect;
pub use event::Event;
#[allow(unused_imports)] // Public API re-exports
pub use state::{RunContext, RunOutcome, RunPhase, RunState, EMPTY_ANSWER_NOTICE};
#[allow(unused_imports)]
pub use transition::{transition, TransitionError, TransitionResult, CANCELLED_ERROR};
