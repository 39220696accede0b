//! Pure state transition function

use super::state::EMPTY_ANSWER_NOTICE;
use super::{Effect, Event, RunContext, RunOutcome, RunPhase, RunState};
use crate::events::RunEvent;
use crate::history::PairingError;
use crate::message::{Message, ToolCall, ToolResult};
use thiserror::Error;

pub const CANCELLED_ERROR: &str = "Run cancelled";

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: RunState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: RunState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    #[must_use]
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    #[must_use]
    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Run already finished")]
    AlreadyTerminal,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function.
///
/// Given the same inputs it always produces the same outputs; every side
/// effect is returned as an [`Effect`] for the executor to perform.
pub fn transition(
    state: &RunState,
    context: &RunContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match (&state.phase, event) {
        (RunPhase::Terminal { .. }, _) => Err(TransitionError::AlreadyTerminal),

        // ============================================================
        // Start
        // ============================================================
        (RunPhase::Reasoning, Event::Start) => Ok(TransitionResult::new(state.clone())
            .with_effect(Effect::PersistCheckpoint)
            .with_effect(Effect::emit(RunEvent::RunStarted {
                thread_id: context.thread_id.clone(),
                run_id: context.run_id.clone(),
            }))
            .with_effect(Effect::RequestModel)),

        // ============================================================
        // Reason phase: decide between answering and acting
        // ============================================================
        (RunPhase::Reasoning, Event::ModelResponded { message }) => {
            Ok(handle_model_turn(state, message))
        }

        (RunPhase::Reasoning, Event::ModelFailed { error }) => Ok(fail(state.clone(), error)),

        // ============================================================
        // Act phase: fold the batch's results back into history
        // ============================================================
        (RunPhase::Acting { calls }, Event::ToolsCompleted { results }) => {
            let ordered = match pair_results(calls, results) {
                Ok(ordered) => ordered,
                Err(e) => return Ok(abort(state, &e.to_string(), e.to_string())),
            };

            let mut new_state = state.clone();
            let mut effects = Vec::with_capacity(ordered.len() * 2 + 2);
            for (call, result) in calls.iter().zip(&ordered) {
                new_state.history.push(Message::tool(result));
                effects.push(Effect::emit(RunEvent::ToolFinished {
                    tool_name: call.tool_name.clone(),
                    output: result.output.clone(),
                    is_error: result.is_error,
                }));
                effects.push(Effect::RecordToolStep {
                    tool_name: call.tool_name.clone(),
                    output: result.output.clone(),
                });
            }
            new_state.revision_number += 1;
            new_state.phase = RunPhase::Reasoning;

            Ok(TransitionResult::new(new_state)
                .with_effects(effects)
                .with_effect(Effect::PersistCheckpoint)
                .with_effect(Effect::RequestModel))
        }

        // ============================================================
        // Cancellation and protocol failures
        // ============================================================
        (_, Event::Cancelled) => Ok(abort(
            state,
            "Cancelled before completion",
            CANCELLED_ERROR.to_string(),
        )),

        (_, Event::Fatal { error }) => Ok(abort(state, &error, error.clone())),

        (phase, event) => Err(TransitionError::InvalidTransition(format!(
            "{event:?} while {}",
            match phase {
                RunPhase::Reasoning => "reasoning",
                RunPhase::Acting { .. } => "acting",
                RunPhase::Terminal { .. } => "terminal",
            }
        ))),
    }
}

fn handle_model_turn(state: &RunState, message: Message) -> TransitionResult {
    let mut new_state = state.clone();
    let turn = Effect::emit(RunEvent::ModelTurn {
        message_id: message.id.clone(),
        usage: message.usage,
    });
    let calls = message.tool_calls.clone();
    let content = message.content.clone();
    new_state.history.push(message);

    if calls.is_empty() {
        let answer = if content.trim().is_empty() {
            EMPTY_ANSWER_NOTICE.to_string()
        } else {
            content
        };
        return complete(new_state, answer, turn);
    }

    if state.revision_number >= state.max_revisions {
        // Ceiling reached: answer every pending call so history stays
        // well-formed, then close the run with what the model had so far.
        let skipped = format!(
            "Skipped: the limit of {} tool cycles was reached",
            state.max_revisions
        );
        new_state.history.extend(
            calls
                .iter()
                .map(|c| Message::tool(&ToolResult::error(&c.call_id, &skipped))),
        );
        let mut answer = format!(
            "I could not complete the task within the allotted {} cycles.",
            state.max_revisions
        );
        if !content.trim().is_empty() {
            answer.push_str("\n\n");
            answer.push_str(content.trim());
        }
        new_state
            .history
            .push(Message::assistant(answer.clone(), vec![], None));
        return complete(new_state, answer, turn);
    }

    new_state.phase = RunPhase::Acting {
        calls: calls.clone(),
    };
    TransitionResult::new(new_state)
        .with_effect(turn)
        .with_effects(calls.iter().map(|c| {
            Effect::emit(RunEvent::ToolStarted {
                tool_name: c.tool_name.clone(),
                arguments: c.arguments.clone(),
            })
        }))
        .with_effect(Effect::DispatchTools { calls })
}

fn complete(mut state: RunState, answer: String, turn: Effect) -> TransitionResult {
    state.final_answer = Some(answer.clone());
    state.phase = RunPhase::Terminal {
        outcome: RunOutcome::Completed,
    };
    TransitionResult::new(state)
        .with_effect(turn)
        .with_effect(Effect::PersistCheckpoint)
        .with_effect(Effect::emit(RunEvent::RunCompleted {
            final_answer: answer,
        }))
}

fn fail(mut state: RunState, error: String) -> TransitionResult {
    state.phase = RunPhase::Terminal {
        outcome: RunOutcome::Failed {
            error: error.clone(),
        },
    };
    TransitionResult::new(state)
        .with_effect(Effect::PersistCheckpoint)
        .with_effect(Effect::failed(error))
}

/// Fail the run, first answering any calls of an in-flight batch with error
/// results. Each closed call is reported as a finished tool, so every
/// `ToolStarted` already sent has its `ToolFinished` before the run fails.
fn abort(state: &RunState, reason: &str, error: String) -> TransitionResult {
    let mut new_state = state.clone();
    let mut closing = Vec::new();
    if let RunPhase::Acting { calls } = &state.phase {
        for call in calls {
            new_state
                .history
                .push(Message::tool(&ToolResult::error(&call.call_id, reason)));
            closing.push(Effect::emit(RunEvent::ToolFinished {
                tool_name: call.tool_name.clone(),
                output: reason.to_string(),
                is_error: true,
            }));
        }
    }
    let failed = fail(new_state, error);
    TransitionResult {
        new_state: failed.new_state,
        effects: closing.into_iter().chain(failed.effects).collect(),
    }
}

/// Match results to calls, returning them in call order. Every call must be
/// answered exactly once and no result may answer an unknown call.
fn pair_results(
    calls: &[ToolCall],
    mut results: Vec<ToolResult>,
) -> Result<Vec<ToolResult>, PairingError> {
    let mut ordered = Vec::with_capacity(calls.len());
    for call in calls {
        let pos = results
            .iter()
            .position(|r| r.call_id == call.call_id)
            .ok_or_else(|| PairingError::Unanswered(call.call_id.clone()))?;
        ordered.push(results.remove(pos));
    }
    match results.into_iter().next() {
        Some(extra) if calls.iter().any(|c| c.call_id == extra.call_id) => {
            Err(PairingError::Duplicated(extra.call_id))
        }
        Some(extra) => Err(PairingError::Orphaned(extra.call_id)),
        None => Ok(ordered),
    }
}
