//! History normalization
//!
//! The model rejects histories where two assistant turns are adjacent, and
//! every tool call must be answered before the next model call. Everything
//! here is pure: the run keeps its append-only history and only the copy sent
//! to the model is normalized.


use crate::message::{Message, Role, ToolCall};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Produce the message sequence sent to the model.
///
/// An empty history becomes a single user turn carrying the task. Runs of
/// consecutive assistant turns collapse into one; every other ordering passes
/// through unchanged.
pub fn normalize(task: &str, history: &[Message]) -> Vec<Message> {
    if history.is_empty() {
        return vec![Message::user(task)];
    }

    let mut normalized: Vec<Message> = Vec::with_capacity(history.len());
    for msg in history {
        match normalized.last_mut() {
            Some(prev) if prev.is_assistant() && msg.is_assistant() => merge_into(prev, msg),
            _ => normalized.push(msg.clone()),
        }
    }
    normalized
}

/// Fold `newer` into `older`, keeping the earlier turn's id.
fn merge_into(older: &mut Message, newer: &Message) {
    if !newer.content.is_empty() {
        if !older.content.is_empty() {
            older.content.push('\n');
        }
        older.content.push_str(&newer.content);
    }
    older.tool_calls.extend(newer.tool_calls.iter().cloned());
    if newer.usage.is_some() {
        older.usage = newer.usage;
    }
}

/// A tool call/result pairing violation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    #[error("Unmatched tool call: {0} has no result")]
    Unanswered(String),
    #[error("Tool result for unknown call: {0}")]
    Orphaned(String),
    #[error("Tool call {0} answered more than once")]
    Duplicated(String),
}

/// Verify every tool call in `history` is answered by exactly one tool turn
/// and every tool turn answers an earlier call.
pub fn check_tool_pairing(history: &[Message]) -> Result<(), PairingError> {
    let mut answers: HashMap<&str, usize> = HashMap::new();
    let mut issued: Vec<&str> = Vec::new();

    for msg in history {
        match msg.role {
            Role::Assistant => {
                issued.extend(msg.tool_calls.iter().map(|c| c.call_id.as_str()));
            }
            Role::Tool => {
                let call_id = msg.tool_result_for.as_deref().unwrap_or_default();
                if !issued.contains(&call_id) {
                    return Err(PairingError::Orphaned(call_id.to_string()));
                }
                let count = answers.entry(call_id).or_insert(0);
                *count += 1;
                if *count > 1 {
                    return Err(PairingError::Duplicated(call_id.to_string()));
                }
            }
            Role::User | Role::System => {}
        }
    }

    match issued.into_iter().find(|id| !answers.contains_key(id)) {
        Some(id) => Err(PairingError::Unanswered(id.to_string())),
        None => Ok(()),
    }
}

/// Give every call in `calls` an id that is unique across `history` and the
/// batch itself. Providers that omit ids (Gemini) or reuse them get fresh
/// `call_<uuid>` ids; well-formed ids are left alone.
pub fn assign_call_ids(history: &[Message], calls: &mut [ToolCall]) {
    let mut seen: HashSet<String> = history
        .iter()
        .flat_map(|m| m.tool_calls.iter().map(|c| c.call_id.clone()))
        .collect();

    for call in calls.iter_mut() {
        if call.call_id.is_empty() || seen.contains(&call.call_id) {
            call.call_id = format!("call_{}", uuid::Uuid::new_v4().simple());
        }
        seen.insert(call.call_id.clone());
    }
}
