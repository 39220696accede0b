//! Run executor
//!
//! Owns one run's state, feeds events through the pure transition function
//! and performs the effects it returns.

use super::traits::{LlmClient, ToolExecutor};
use crate::accounting::Pricing;
use crate::checkpoint::CheckpointStore;
use crate::events::EventBus;
use crate::history::{assign_call_ids, check_tool_pairing, normalize};
use crate::llm::LlmRequest;
use crate::message::Message;
use crate::run_status::{RunStatusSink, StatusUpdate, StepRecord};
use crate::state_machine::{transition, Effect, Event, RunContext, RunOutcome, RunPhase, RunState};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-run settings that do not change while it executes
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub system_prompt: String,
    pub pricing: Pricing,
    pub max_tokens: Option<u32>,
}

/// Storage and reporting collaborators shared by all runs
#[derive(Clone)]
pub struct RunSinks {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub status: Arc<dyn RunStatusSink>,
}

/// Executes a single run to a terminal state
pub struct RunExecutor<L: LlmClient + ?Sized, T: ToolExecutor + ?Sized> {
    context: RunContext,
    state: RunState,
    llm: Arc<L>,
    tools: Arc<T>,
    sinks: RunSinks,
    bus: EventBus,
    cancel: CancellationToken,
    settings: ExecutorSettings,
}

impl<L: LlmClient + ?Sized, T: ToolExecutor + ?Sized> RunExecutor<L, T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: RunContext,
        state: RunState,
        llm: Arc<L>,
        tools: Arc<T>,
        sinks: RunSinks,
        bus: EventBus,
        cancel: CancellationToken,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            context,
            state,
            llm,
            tools,
            sinks,
            bus,
            cancel,
            settings,
        }
    }

    /// Drive the run to completion and return its final state
    pub async fn run(mut self) -> RunState {
        tracing::info!(
            thread_id = %self.context.thread_id,
            run_id = %self.context.run_id,
            revision = self.state.revision_number,
            max_revisions = self.state.max_revisions,
            "Starting run"
        );

        if let Err(e) = self
            .sinks
            .status
            .update_status(&self.context.run_id, &StatusUpdate::running())
            .await
        {
            tracing::warn!(run_id = %self.context.run_id, error = %e, "Failed to mark run running");
        }

        self.drive(Event::Start).await;
        if !self.state.is_terminal() {
            // Only reachable if a transition was rejected mid-run
            self.drive(Event::Fatal {
                error: "Run stopped before reaching a final answer".to_string(),
            })
            .await;
        }

        self.finish().await;
        self.state
    }

    /// Process events until no effect produces another one
    async fn drive(&mut self, first: Event) {
        let mut events = vec![first];

        while let Some(event) = events.pop() {
            let result = match transition(&self.state, &self.context, event) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(thread_id = %self.context.thread_id, error = %e, "Rejected transition");
                    return;
                }
            };
            self.state = result.new_state;

            for effect in result.effects {
                if let Some(next) = self.execute_effect(effect).await {
                    events.push(next);
                }
            }
        }
    }

    async fn execute_effect(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::PersistCheckpoint => {
                if let Err(e) = self
                    .sinks
                    .checkpoints
                    .save(&self.context.thread_id, &self.context.run_id, &self.state)
                    .await
                {
                    tracing::warn!(
                        thread_id = %self.context.thread_id,
                        phase = self.state.phase_label(),
                        error = %e,
                        "Checkpoint write failed, continuing"
                    );
                }
                None
            }

            Effect::RequestModel => Some(self.request_model().await),

            Effect::DispatchTools { calls } => {
                let results = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return Some(Event::Cancelled),
                    results = self.tools.dispatch(&calls, &self.context.thread_id, &self.cancel) => results,
                };
                Some(Event::ToolsCompleted { results })
            }

            Effect::Emit(event) => {
                self.bus.emit(event);
                None
            }

            Effect::RecordToolStep { tool_name, output } => {
                let step = StepRecord::tool_call(&tool_name, &output);
                if let Err(e) = self.sinks.status.log_step(&self.context.run_id, &step).await {
                    tracing::warn!(run_id = %self.context.run_id, error = %e, "Failed to log step");
                }
                None
            }
        }
    }

    async fn request_model(&self) -> Event {
        if self.cancel.is_cancelled() {
            return Event::Cancelled;
        }
        if let Err(e) = check_tool_pairing(&self.state.history) {
            return Event::Fatal {
                error: e.to_string(),
            };
        }

        let request = LlmRequest {
            system: self.settings.system_prompt.clone(),
            messages: normalize(&self.state.task, &self.state.history),
            tools: self.tools.definitions(),
            max_tokens: self.settings.max_tokens,
        };

        let response = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Event::Cancelled,
            response = self.llm.complete(&request) => response,
        };

        match response {
            Ok(mut response) => {
                assign_call_ids(&self.state.history, &mut response.tool_calls);
                Event::ModelResponded {
                    message: Message::assistant(response.text, response.tool_calls, response.usage),
                }
            }
            Err(e) => {
                tracing::error!(
                    thread_id = %self.context.thread_id,
                    model = %self.llm.model_id(),
                    error = %e,
                    "Model call failed"
                );
                Event::ModelFailed {
                    error: e.message,
                }
            }
        }
    }

    /// Settle usage and report the terminal status
    async fn finish(&mut self) {
        let tally = self.bus.reconcile(&self.state.history);
        let cost = tally.cost(&self.settings.pricing);

        let update = match &self.state.phase {
            RunPhase::Terminal {
                outcome: RunOutcome::Completed,
            } => StatusUpdate::completed(
                json!({
                    "response": self.state.final_answer.clone().unwrap_or_default(),
                    "tokens": tally.total(),
                    "usage": tally.to_json(),
                }),
                cost,
            ),
            _ => {
                let mut update =
                    StatusUpdate::failed(self.state.error().unwrap_or("Run did not finish"));
                update.cost_usd = Some(cost);
                update
            }
        };

        if let Err(e) = self
            .sinks
            .status
            .update_status(&self.context.run_id, &update)
            .await
        {
            tracing::warn!(run_id = %self.context.run_id, error = %e, "Failed to report run status");
        }

        tracing::info!(
            thread_id = %self.context.thread_id,
            run_id = %self.context.run_id,
            status = update.status.as_str(),
            revision = self.state.revision_number,
            input_tokens = tally.input_tokens,
            output_tokens = tally.output_tokens,
            cost_usd = cost,
            "Run finished"
        );
    }
}
