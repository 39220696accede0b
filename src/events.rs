//! Run events and the per-run event bus
//!
//! Events are broadcast in the order transitions produce them. The bus also
//! feeds model-turn usage into the run's accountant.

use crate::accounting::{UsageAccountant, UsageTally};
use crate::llm::Usage;
use crate::message::Message;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;

/// Capacity of a run's broadcast channel; slow subscribers lag past this.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    RunStarted {
        thread_id: String,
        run_id: String,
    },
    ToolStarted {
        tool_name: String,
        arguments: Value,
    },
    ToolFinished {
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Internal: a model turn finished. Never sent to stream clients.
    ModelTurn {
        message_id: String,
        usage: Option<Usage>,
    },
    RunCompleted {
        final_answer: String,
    },
    RunFailed {
        error: String,
    },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::RunCompleted { .. } | RunEvent::RunFailed { .. })
    }
}

/// What a subscriber gets from a run's channel
#[derive(Debug)]
pub enum Subscription {
    /// The run has not ended yet; its terminal event is still ahead
    Live(broadcast::Receiver<RunEvent>),
    /// The run already emitted this terminal event
    Finished(RunEvent),
}

/// Sending side of one run's events, shared by the executor and whoever
/// hands out subscriptions.
///
/// The terminal event is kept after it is sent, so a subscriber arriving
/// while the run is still reporting its final status gets it replayed.
#[derive(Clone)]
pub struct RunChannel {
    tx: broadcast::Sender<RunEvent>,
    terminal: Arc<OnceLock<RunEvent>>,
}

impl Default for RunChannel {
    fn default() -> Self {
        Self {
            tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            terminal: Arc::new(OnceLock::new()),
        }
    }
}

impl RunChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw receiver for callers that subscribe before the run starts
    pub fn receiver(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    pub fn subscribe(&self) -> Subscription {
        // The terminal slot is filled before the send, so a receiver taken
        // here either sees it in the slot or still ahead in the channel.
        let rx = self.tx.subscribe();
        match self.terminal.get() {
            Some(event) => Subscription::Finished(event.clone()),
            None => Subscription::Live(rx),
        }
    }

    fn send(&self, event: RunEvent) {
        if event.is_terminal() {
            let _ = self.terminal.set(event.clone());
        }
        // No subscribers is fine: runs started with /agent/run are not watched
        let _ = self.tx.send(event);
    }
}

pub struct EventBus {
    channel: RunChannel,
    accountant: UsageAccountant,
}

impl EventBus {
    pub fn new(channel: RunChannel) -> Self {
        Self {
            channel,
            accountant: UsageAccountant::new(),
        }
    }

    pub fn emit(&mut self, event: RunEvent) {
        if let RunEvent::ModelTurn { message_id, usage } = &event {
            self.accountant.observe(message_id, usage.as_ref());
        }
        self.channel.send(event);
    }

    /// Final usage for the run, folding in anything the live events missed
    pub fn reconcile(&mut self, history: &[Message]) -> UsageTally {
        self.accountant.reconcile(history)
    }
}
