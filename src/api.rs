//! HTTP API for the research agent

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;

use crate::runtime::RunManager;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runs: Arc<RunManager>,
}

impl AppState {
    pub fn new(runs: RunManager) -> Self {
        Self {
            runs: Arc::new(runs),
        }
    }
}
