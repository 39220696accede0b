//! Token usage accounting and cost
//!
//! The accountant sees usage twice: live, as model-turn events are emitted,
//! and once at the end of the run from the final history. Each assistant
//! message is counted at most once across both paths.

use crate::llm::Usage;
use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Unit prices in USD per million tokens
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Pricing {
    pub fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
        }
    }

    pub fn is_free(&self) -> bool {
        self.input_per_mtok == 0.0 && self.output_per_mtok == 0.0
    }
}

/// Running token totals for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTally {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageTally {
    pub fn add(&mut self, usage: &Usage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Cost in USD, rounded to six decimal places (the precision run records
    /// store).
    #[allow(clippy::cast_precision_loss)] // token counts stay far below 2^52
    pub fn cost(&self, pricing: &Pricing) -> f64 {
        let raw = (self.input_tokens as f64 / 1_000_000.0) * pricing.input_per_mtok
            + (self.output_tokens as f64 / 1_000_000.0) * pricing.output_per_mtok;
        (raw * 1_000_000.0).round() / 1_000_000.0
    }

    pub fn to_json(self) -> serde_json::Value {
        serde_json::json!({
            "input_tokens": self.input_tokens,
            "output_tokens": self.output_tokens,
            "total_tokens": self.total(),
        })
    }
}

#[derive(Debug, Default)]
pub struct UsageAccountant {
    tally: UsageTally,
    counted: HashSet<String>,
    reconciled: bool,
}

impl UsageAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a model turn's usage. Returns false when the message was
    /// already counted or carried no usage.
    pub fn observe(&mut self, message_id: &str, usage: Option<&Usage>) -> bool {
        let Some(usage) = usage else {
            return false;
        };
        if !self.counted.insert(message_id.to_string()) {
            return false;
        }
        self.tally.add(usage);
        true
    }

    /// Fold in usage from assistant messages that never passed through
    /// `observe`. Only the first call scans the history.
    pub fn reconcile(&mut self, history: &[Message]) -> UsageTally {
        if !self.reconciled {
            self.reconciled = true;
            for msg in history.iter().filter(|m| m.is_assistant()) {
                self.observe(&msg.id, msg.usage.as_ref());
            }
        }
        self.tally
    }

    #[allow(dead_code)] // Used in tests
    pub fn tally(&self) -> UsageTally {
        self.tally
    }
}
