//! Tools available to the research agent
//!
//! Tools are stateless singletons; per-call context arrives through
//! [`ToolContext`]. The registry dispatches a whole batch of calls at once.

mod retrieve;
mod scrape;
mod search;

pub use retrieve::{format_direct_answer, MemoryClient, MemoryError, RetrieveMemoryTool};
pub use scrape::ScrapeTool;
pub use search::SearchTool;

use crate::llm::ToolDefinition;
use crate::message::{ToolCall, ToolResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-tool timeout unless a tool overrides it
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Result from tool execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
        }
    }

    fn into_result(self, call_id: String) -> ToolResult {
        ToolResult {
            call_id,
            output: self.output,
            is_error: !self.success,
        }
    }
}

/// Context for one tool invocation
#[derive(Clone)]
pub struct ToolContext {
    /// Cancellation signal for the owning run
    pub cancel: CancellationToken,
    pub thread_id: String,
    pub call_id: String,
}

/// Trait for tools that can be executed by the agent
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    /// Upper bound on one invocation; the dispatcher enforces it
    fn timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput;
}

/// Parse a tool's typed input, mapping failures to the error output the
/// model sees.
pub(crate) fn parse_input<T: serde::de::DeserializeOwned>(input: Value) -> Result<T, ToolOutput> {
    serde_json::from_value(input).map_err(|e| ToolOutput::error(format!("Invalid input: {e}")))
}

/// External endpoints the standard tools talk to
#[derive(Debug, Clone)]
pub struct ToolsConfig {
    pub search_base_url: String,
}

/// Collection of tools available to runs
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools }
    }

    /// The research tool set: knowledge-base retrieval, web search and page
    /// scraping.
    pub fn standard(config: &ToolsConfig, memory: Option<Arc<MemoryClient>>) -> Self {
        Self::new(vec![
            Arc::new(RetrieveMemoryTool::new(memory)),
            Arc::new(SearchTool::new(config.search_base_url.clone())),
            Arc::new(ScrapeTool),
        ])
    }

    /// Tool definitions advertised to the model
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    /// Run every call of one batch concurrently and return one result per
    /// call, in call order. Failures of any kind become error results.
    pub async fn dispatch(
        &self,
        calls: &[ToolCall],
        thread_id: &str,
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        let handles: Vec<_> = calls
            .iter()
            .map(|call| {
                let tool = self.get(&call.tool_name);
                let call = call.clone();
                let ctx = ToolContext {
                    cancel: cancel.child_token(),
                    thread_id: thread_id.to_string(),
                    call_id: call.call_id.clone(),
                };
                tokio::spawn(run_one(tool, call, ctx))
            })
            .collect();

        let joined = futures::future::join_all(handles).await;
        calls
            .iter()
            .zip(joined)
            .map(|(call, joined)| {
                joined.unwrap_or_else(|e| {
                    tracing::error!(tool = %call.tool_name, error = %e, "Tool task failed");
                    ToolResult::error(
                        &call.call_id,
                        format!("Tool {} crashed: {e}", call.tool_name),
                    )
                })
            })
            .collect()
    }
}

async fn run_one(tool: Option<Arc<dyn Tool>>, call: ToolCall, ctx: ToolContext) -> ToolResult {
    let Some(tool) = tool else {
        return ToolResult::error(call.call_id, format!("Unknown tool: {}", call.tool_name));
    };

    let limit = tool.timeout();
    let started = std::time::Instant::now();
    let result = match tokio::time::timeout(limit, tool.run(call.arguments, ctx)).await {
        Ok(output) => output.into_result(call.call_id),
        Err(_) => ToolResult::error(
            call.call_id,
            format!("Tool {} timed out after {}s", call.tool_name, limit.as_secs()),
        ),
    };
    tracing::info!(
        tool = %call.tool_name,
        duration_ms = %started.elapsed().as_millis(),
        is_error = result.is_error,
        "Tool finished"
    );
    result
}
