//! Property-based tests for the state machine
//!
//! These drive whole runs through `transition` with scripted model turns and
//! check the run-level invariants on every path.

use super::*;
use crate::events::RunEvent;
use crate::history::check_tool_pairing;
use crate::message::{Message, ToolCall, ToolResult};
use proptest::prelude::*;
use serde_json::json;

// ============================================================================
// Test Helpers
// ============================================================================

fn ctx() -> RunContext {
    RunContext::new("prop-thread", "prop-run")
}

/// One scripted model turn: number of tool calls requested, or a failure
#[derive(Debug, Clone)]
enum Turn {
    Calls(usize),
    Fail,
}

/// Everything observable about a finished simulated run
struct Trace {
    state: RunState,
    events: Vec<RunEvent>,
    dispatches: usize,
    /// Whether history was well-paired at every model request
    paired_at_requests: bool,
}

/// Run the state machine to completion, answering each dispatch with one
/// result per call. Turns past the end of the script answer with text.
fn simulate(max_revisions: u32, script: &[Turn]) -> Trace {
    let mut state = RunState::new("task", max_revisions);
    let mut queue = vec![Event::Start];
    let mut events = Vec::new();
    let mut dispatches = 0;
    let mut paired_at_requests = true;
    let mut turn = 0usize;
    let mut next_id = 0usize;

    while let Some(event) = queue.pop() {
        let result = transition(&state, &ctx(), event).expect("valid transition");
        state = result.new_state;
        for effect in result.effects {
            match effect {
                Effect::Emit(e) => events.push(e),
                Effect::RequestModel => {
                    paired_at_requests &= check_tool_pairing(&state.history).is_ok();
                    let next = match script.get(turn) {
                        Some(Turn::Fail) => Event::ModelFailed {
                            error: "model down".to_string(),
                        },
                        Some(Turn::Calls(n)) if *n > 0 => {
                            let calls = (0..*n)
                                .map(|_| {
                                    next_id += 1;
                                    ToolCall::new(
                                        format!("call_{next_id}"),
                                        "search_tool",
                                        json!({"query": next_id}),
                                    )
                                })
                                .collect();
                            Event::ModelResponded {
                                message: Message::assistant("", calls, None),
                            }
                        }
                        _ => Event::ModelResponded {
                            message: Message::assistant("done", vec![], None),
                        },
                    };
                    turn += 1;
                    queue.push(next);
                }
                Effect::DispatchTools { calls } => {
                    dispatches += 1;
                    let results = calls
                        .iter()
                        .map(|c| ToolResult::success(&c.call_id, "ok"))
                        .collect();
                    queue.push(Event::ToolsCompleted { results });
                }
                Effect::PersistCheckpoint | Effect::RecordToolStep { .. } => {}
            }
        }
    }

    Trace {
        state,
        events,
        dispatches,
        paired_at_requests,
    }
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_turn() -> impl Strategy<Value = Turn> {
    prop_oneof![
        8 => (0usize..4).prop_map(Turn::Calls),
        1 => Just(Turn::Fail),
    ]
}

fn arb_script() -> impl Strategy<Value = Vec<Turn>> {
    proptest::collection::vec(arb_turn(), 0..8)
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_revision_never_exceeds_ceiling(max in 0u32..5, script in arb_script()) {
        let trace = simulate(max, &script);
        prop_assert!(trace.state.revision_number <= max);
        prop_assert!(trace.dispatches <= max as usize);
        prop_assert!(trace.state.is_terminal());
    }

    #[test]
    fn prop_exactly_one_terminal_event_last(max in 0u32..5, script in arb_script()) {
        let trace = simulate(max, &script);
        let terminal = trace.events.iter().filter(|e| e.is_terminal()).count();
        prop_assert_eq!(terminal, 1);
        prop_assert!(trace.events.last().is_some_and(RunEvent::is_terminal));
        prop_assert!(
            matches!(trace.events.first(), Some(RunEvent::RunStarted { .. })),
            "run-started first"
        );
    }

    #[test]
    fn prop_tool_starts_match_tool_ends(max in 0u32..5, script in arb_script()) {
        let trace = simulate(max, &script);
        let started: Vec<_> = trace.events.iter().filter_map(|e| match e {
            RunEvent::ToolStarted { tool_name, .. } => Some(tool_name.clone()),
            _ => None,
        }).collect();
        let finished: Vec<_> = trace.events.iter().filter_map(|e| match e {
            RunEvent::ToolFinished { tool_name, .. } => Some(tool_name.clone()),
            _ => None,
        }).collect();
        prop_assert_eq!(started, finished);
    }

    #[test]
    fn prop_history_paired_before_every_model_call(max in 0u32..5, script in arb_script()) {
        let trace = simulate(max, &script);
        prop_assert!(trace.paired_at_requests);
    }

    #[test]
    fn prop_completed_runs_have_answer(max in 0u32..5, script in arb_script()) {
        let trace = simulate(max, &script);
        match &trace.state.phase {
            RunPhase::Terminal { outcome: RunOutcome::Completed } => {
                prop_assert!(trace.state.final_answer.as_deref().is_some_and(|a| !a.is_empty()));
                prop_assert!(check_tool_pairing(&trace.state.history).is_ok());
            }
            RunPhase::Terminal { outcome: RunOutcome::Failed { .. } } => {
                prop_assert!(trace.state.final_answer.is_none());
            }
            other => prop_assert!(false, "run ended in {:?}", other),
        }
    }

    #[test]
    fn prop_zero_ceiling_single_reason_phase(script in arb_script()) {
        let trace = simulate(0, &script);
        prop_assert_eq!(trace.dispatches, 0);
        prop_assert_eq!(trace.state.revision_number, 0);
        let turns = trace.events.iter()
            .filter(|e| matches!(e, RunEvent::ModelTurn { .. }))
            .count();
        prop_assert!(turns <= 1);
    }

    #[test]
    fn prop_terminal_state_rejects_everything(max in 0u32..3, script in arb_script()) {
        let trace = simulate(max, &script);
        for event in [Event::Start, Event::Cancelled, Event::ToolsCompleted { results: vec![] }] {
            prop_assert_eq!(
                transition(&trace.state, &ctx(), event).unwrap_err(),
                TransitionError::AlreadyTerminal
            );
        }
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_scenario_always_tool_calls_hits_ceiling() {
    let script = vec![Turn::Calls(1); 10];
    let trace = simulate(2, &script);

    assert_eq!(trace.state.revision_number, 2);
    assert_eq!(trace.dispatches, 2);
    assert_eq!(trace.state.phase_label(), "completed");
    assert!(trace
        .state
        .final_answer
        .unwrap()
        .contains("could not complete the task"));
}

#[test]
fn test_scenario_failure_on_first_call() {
    let trace = simulate(2, &[Turn::Fail]);
    assert_eq!(trace.state.error(), Some("model down"));
    assert_eq!(trace.events.len(), 2);
    assert!(matches!(trace.events[1], RunEvent::RunFailed { .. }));
}
