//! Mock implementations for testing
//!
//! These mocks drive the executor end to end without network or disk I/O.

use super::executor::{ExecutorSettings, RunExecutor, RunSinks};
use super::traits::*;
use crate::accounting::Pricing;
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, MemoryCheckpointStore};
use crate::events::{EventBus, RunChannel, RunEvent};
use crate::llm::{LlmError, LlmRequest, LlmResponse, ToolDefinition};
use crate::message::{ToolCall, ToolResult};
use crate::run_status::{
    NewRun, RunStatus, RunStatusSink, StatusSinkError, StatusUpdate, StepRecord,
};
use crate::state_machine::{RunContext, RunState};
use crate::tools::ToolOutput;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Mock LLM Client
// ============================================================================

/// Mock LLM client that returns queued responses
pub struct MockLlmClient {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    model_id: String,
    /// Record of all requests made
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl MockLlmClient {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            model_id: model_id.into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful response
    pub fn queue_response(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    /// Queue an error response
    pub fn queue_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Get recorded requests
    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_response(&self) -> Result<LlmResponse, LlmError> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network("No mock response queued")))
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        self.next_response()
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ============================================================================
// Delayed Mock LLM Client (for cancellation testing)
// ============================================================================

/// Mock LLM client with configurable delay
pub struct DelayedMockLlmClient {
    inner: MockLlmClient,
    delay: Duration,
    /// Notified when a request starts
    pub request_started: Arc<Notify>,
}

impl DelayedMockLlmClient {
    pub fn new(model_id: impl Into<String>, delay: Duration) -> Self {
        Self {
            inner: MockLlmClient::new(model_id),
            delay,
            request_started: Arc::new(Notify::new()),
        }
    }

    pub fn queue_response(&self, response: LlmResponse) {
        self.inner.queue_response(response);
    }
}

#[async_trait]
impl LlmClient for DelayedMockLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.inner.requests.lock().unwrap().push(request.clone());
        self.request_started.notify_one();
        tokio::time::sleep(self.delay).await;
        self.inner.next_response()
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}

// ============================================================================
// Mock Tool Executor
// ============================================================================

/// Mock tool executor with predefined outputs
pub struct MockToolExecutor {
    outputs: HashMap<String, ToolOutput>,
    definitions: Vec<ToolDefinition>,
    /// Every call dispatched, in order
    pub executions: Mutex<Vec<ToolCall>>,
}

impl MockToolExecutor {
    pub fn new() -> Self {
        Self {
            outputs: HashMap::new(),
            definitions: Vec::new(),
            executions: Mutex::new(Vec::new()),
        }
    }

    /// Add a tool with a predefined output
    pub fn with_tool(mut self, name: impl Into<String>, output: ToolOutput) -> Self {
        let name = name.into();
        self.definitions.push(ToolDefinition {
            name: name.clone(),
            description: format!("Mock {name}"),
            input_schema: serde_json::json!({ "type": "object", "properties": {} }),
        });
        self.outputs.insert(name, output);
        self
    }

    pub fn recorded_executions(&self) -> Vec<ToolCall> {
        self.executions.lock().unwrap().clone()
    }

    fn result_for(&self, call: &ToolCall) -> ToolResult {
        match self.outputs.get(&call.tool_name) {
            Some(out) if out.success => ToolResult::success(&call.call_id, &out.output),
            Some(out) => ToolResult::error(&call.call_id, &out.output),
            None => ToolResult::error(&call.call_id, format!("Unknown tool: {}", call.tool_name)),
        }
    }
}

impl Default for MockToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for MockToolExecutor {
    async fn dispatch(
        &self,
        calls: &[ToolCall],
        _thread_id: &str,
        _cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        self.executions.lock().unwrap().extend(calls.iter().cloned());
        calls.iter().map(|c| self.result_for(c)).collect()
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }
}

// ============================================================================
// Delayed Mock Tool Executor (for cancellation testing)
// ============================================================================

/// Mock tool executor with configurable delay
pub struct DelayedMockToolExecutor {
    inner: MockToolExecutor,
    delay: Duration,
    /// Notified when a batch starts
    pub execution_started: Arc<Notify>,
}

impl DelayedMockToolExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MockToolExecutor::new(),
            delay,
            execution_started: Arc::new(Notify::new()),
        }
    }

    pub fn with_tool(mut self, name: impl Into<String>, output: ToolOutput) -> Self {
        self.inner = self.inner.with_tool(name, output);
        self
    }
}

#[async_trait]
impl ToolExecutor for DelayedMockToolExecutor {
    async fn dispatch(
        &self,
        calls: &[ToolCall],
        thread_id: &str,
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        self.execution_started.notify_one();
        tokio::select! {
            () = tokio::time::sleep(self.delay) => {
                self.inner.dispatch(calls, thread_id, cancel).await
            }
            () = cancel.cancelled() => {
                calls.iter().map(|c| ToolResult::error(&c.call_id, "cancelled")).collect()
            }
        }
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.inner.definitions()
    }
}

// ============================================================================
// Storage and status doubles
// ============================================================================

/// Checkpoint store whose writes always fail
#[derive(Default)]
pub struct FailingCheckpointStore {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl CheckpointStore for FailingCheckpointStore {
    async fn save(
        &self,
        _thread_id: &str,
        _run_id: &str,
        _state: &RunState,
    ) -> Result<String, CheckpointError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(CheckpointError::Task("disk full".to_string()))
    }

    async fn load_latest(&self, _thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Err(CheckpointError::Task("disk full".to_string()))
    }

    async fn list(&self, _thread_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        Err(CheckpointError::Task("disk full".to_string()))
    }
}

/// Status sink that keeps everything it is told
#[derive(Default)]
pub struct RecordingStatusSink {
    pub created: Mutex<Vec<NewRun>>,
    pub updates: Mutex<Vec<(String, StatusUpdate)>>,
    pub steps: Mutex<Vec<(String, StepRecord)>>,
    fail_create: AtomicBool,
    create_delay: Duration,
    final_update_delay: Duration,
}

impl RecordingStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create_run` fail, as when backend-core is unreachable
    pub fn failing_create() -> Self {
        let sink = Self::default();
        sink.fail_create.store(true, Ordering::SeqCst);
        sink
    }

    /// Hold `create_run` open, as a slow backend-core would
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Hold the final COMPLETED or FAILED update open
    pub fn with_final_update_delay(mut self, delay: Duration) -> Self {
        self.final_update_delay = delay;
        self
    }

    pub fn recorded_updates(&self) -> Vec<(String, StatusUpdate)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn recorded_steps(&self) -> Vec<(String, StepRecord)> {
        self.steps.lock().unwrap().clone()
    }

    /// The last update reported for `run_id`
    pub fn last_update(&self, run_id: &str) -> Option<StatusUpdate> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id == run_id)
            .map(|(_, u)| u.clone())
    }
}

#[async_trait]
impl RunStatusSink for RecordingStatusSink {
    async fn create_run(&self, run: &NewRun) -> Result<String, StatusSinkError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(StatusSinkError::Rejected {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        tokio::time::sleep(self.create_delay).await;
        let mut created = self.created.lock().unwrap();
        created.push(run.clone());
        Ok(format!("run-{}", created.len()))
    }

    async fn update_status(
        &self,
        run_id: &str,
        update: &StatusUpdate,
    ) -> Result<(), StatusSinkError> {
        if matches!(update.status, RunStatus::Completed | RunStatus::Failed) {
            tokio::time::sleep(self.final_update_delay).await;
        }
        self.updates
            .lock()
            .unwrap()
            .push((run_id.to_string(), update.clone()));
        Ok(())
    }

    async fn log_step(&self, run_id: &str, step: &StepRecord) -> Result<(), StatusSinkError> {
        self.steps
            .lock()
            .unwrap()
            .push((run_id.to_string(), step.clone()));
        Ok(())
    }
}

// ============================================================================
// Test Run Builder
// ============================================================================

pub const TEST_THREAD: &str = "test-thread";
pub const TEST_RUN: &str = "test-run";

/// Helper for executing a single run with minimal boilerplate
pub struct TestRun<L: LlmClient + 'static, T: ToolExecutor + 'static> {
    state: RunState,
    llm: Arc<L>,
    tools: Arc<T>,
    checkpoints: Arc<dyn CheckpointStore>,
    status: Arc<RecordingStatusSink>,
    pricing: Pricing,
}

impl TestRun<MockLlmClient, MockToolExecutor> {
    pub fn new(task: &str) -> Self {
        Self {
            state: RunState::new(task, 2),
            llm: Arc::new(MockLlmClient::new("test-model")),
            tools: Arc::new(MockToolExecutor::new()),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            status: Arc::new(RecordingStatusSink::new()),
            pricing: Pricing::default(),
        }
    }
}

impl<L: LlmClient + 'static, T: ToolExecutor + 'static> TestRun<L, T> {
    pub fn llm<L2: LlmClient + 'static>(self, llm: Arc<L2>) -> TestRun<L2, T> {
        TestRun {
            state: self.state,
            llm,
            tools: self.tools,
            checkpoints: self.checkpoints,
            status: self.status,
            pricing: self.pricing,
        }
    }

    pub fn tools<T2: ToolExecutor + 'static>(self, tools: Arc<T2>) -> TestRun<L, T2> {
        TestRun {
            state: self.state,
            llm: self.llm,
            tools,
            checkpoints: self.checkpoints,
            status: self.status,
            pricing: self.pricing,
        }
    }

    #[must_use]
    pub fn max_revisions(mut self, max: u32) -> Self {
        self.state.max_revisions = max;
        self
    }

    #[must_use]
    pub fn state(mut self, state: RunState) -> Self {
        self.state = state;
        self
    }

    #[must_use]
    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    #[must_use]
    pub fn pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    /// Spawn the executor, subscribing before the first event is emitted
    pub fn start(self) -> StartedRun {
        let channel = RunChannel::new();
        let rx = channel.receiver();
        let cancel = CancellationToken::new();
        let executor = RunExecutor::new(
            RunContext::new(TEST_THREAD, TEST_RUN),
            self.state,
            self.llm,
            self.tools,
            RunSinks {
                checkpoints: self.checkpoints,
                status: self.status.clone(),
            },
            EventBus::new(channel),
            cancel.clone(),
            ExecutorSettings {
                system_prompt: "You are a test agent.".to_string(),
                pricing: self.pricing,
                max_tokens: Some(1024),
            },
        );

        StartedRun {
            rx,
            cancel,
            status: self.status,
            handle: tokio::spawn(executor.run()),
        }
    }

    /// Run to completion and return the final state with every event
    pub async fn run(self) -> (RunState, Vec<RunEvent>, Arc<RecordingStatusSink>) {
        let mut started = self.start();
        let state = started.wait().await;
        let events = started.events();
        (state, events, started.status)
    }
}

pub struct StartedRun {
    pub rx: broadcast::Receiver<RunEvent>,
    pub cancel: CancellationToken,
    pub status: Arc<RecordingStatusSink>,
    handle: tokio::task::JoinHandle<RunState>,
}

impl StartedRun {
    /// Wait for the executor to return, failing the test after five seconds
    pub async fn wait(&mut self) -> RunState {
        tokio::time::timeout(Duration::from_secs(5), &mut self.handle)
            .await
            .expect("run did not finish in time")
            .expect("executor panicked")
    }

    /// Drain every event received so far
    pub fn events(&mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Events a stream client would see (model-turn bookkeeping removed)
pub fn visible(events: &[RunEvent]) -> Vec<&RunEvent> {
    events
        .iter()
        .filter(|e| !matches!(e, RunEvent::ModelTurn { .. }))
        .collect()
}

pub fn arguments(value: &str) -> Value {
    serde_json::json!({ "query": value })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Usage;
    use crate::message::Role;
    use crate::run_status::RunStatus;
    use crate::state_machine::{RunOutcome, RunPhase, CANCELLED_ERROR};
    use serde_json::json;

    fn call(id: &str, tool: &str, query: &str) -> ToolCall {
        ToolCall::new(id, tool, arguments(query))
    }

    fn memory_tools() -> Arc<MockToolExecutor> {
        Arc::new(
            MockToolExecutor::new()
                .with_tool("retrieve_memory", ToolOutput::success("Title: Guide\nContent: 42"))
                .with_tool("search_tool", ToolOutput::success("web result"))
                .with_tool("scrape_tool", ToolOutput::error("Failed to scrape x: 404")),
        )
    }

    // ========================================================================
    // Mocks
    // ========================================================================

    #[tokio::test]
    async fn test_mock_llm_client() {
        let mock = MockLlmClient::new("test-model");
        mock.queue_response(LlmResponse::text("Hello"));

        let request = LlmRequest {
            system: String::new(),
            messages: vec![],
            tools: vec![],
            max_tokens: Some(100),
        };

        let response = mock.complete(&request).await.unwrap();
        assert_eq!(response.text, "Hello");
        assert!(response.end_turn);

        // Second call should fail (no more responses)
        assert!(mock.complete(&request).await.is_err());
        assert_eq!(mock.recorded_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_tool_executor() {
        let tools = memory_tools();
        let results = tools
            .dispatch(
                &[call("a", "retrieve_memory", "q"), call("b", "nope", "q")],
                "t",
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(results[0], ToolResult::success("a", "Title: Guide\nContent: 42"));
        assert_eq!(results[1], ToolResult::error("b", "Unknown tool: nope"));
        assert_eq!(tools.recorded_executions().len(), 2);
    }

    // ========================================================================
    // Full runs
    // ========================================================================

    #[tokio::test]
    async fn test_direct_answer() {
        let llm = Arc::new(MockLlmClient::new("test-model"));
        llm.queue_response(LlmResponse::text("4").with_usage(Usage::new(100, 5)));

        let (state, events, status) = TestRun::new("What is 2+2").llm(llm.clone()).run().await;

        assert_eq!(state.final_answer.as_deref(), Some("4"));
        assert_eq!(state.revision_number, 0);
        assert_eq!(state.history.len(), 2);

        let visible = visible(&events);
        assert_eq!(visible.len(), 2);
        assert!(matches!(visible[0], RunEvent::RunStarted { thread_id, run_id }
            if thread_id == TEST_THREAD && run_id == TEST_RUN));
        assert_eq!(
            visible[1],
            &RunEvent::RunCompleted {
                final_answer: "4".to_string()
            }
        );

        let updates = status.recorded_updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].1.status, RunStatus::Running);
        let done = &updates[1].1;
        assert_eq!(done.status, RunStatus::Completed);
        let output = done.output_result.as_ref().unwrap();
        assert_eq!(output["response"], "4");
        assert_eq!(output["tokens"], 105);

        // The model saw the task and the system prompt
        let requests = llm.recorded_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].system, "You are a test agent.");
        assert_eq!(requests[0].messages[0].role, Role::User);
        assert_eq!(requests[0].messages[0].content, "What is 2+2");
    }

    #[tokio::test]
    async fn test_one_tool_cycle() {
        let llm = Arc::new(MockLlmClient::new("test-model"));
        llm.queue_response(LlmResponse::tool_calls(vec![call(
            "c1",
            "retrieve_memory",
            "answer",
        )]));
        llm.queue_response(LlmResponse::text("The answer is 42."));

        let (state, events, status) = TestRun::new("What is the answer?")
            .llm(llm.clone())
            .tools(memory_tools())
            .run()
            .await;

        assert_eq!(state.final_answer.as_deref(), Some("The answer is 42."));
        assert_eq!(state.revision_number, 1);

        let kinds: Vec<_> = visible(&events)
            .into_iter()
            .map(|e| match e {
                RunEvent::RunStarted { .. } => "start",
                RunEvent::ToolStarted { .. } => "tool_start",
                RunEvent::ToolFinished { .. } => "tool_end",
                RunEvent::RunCompleted { .. } => "complete",
                RunEvent::RunFailed { .. } => "error",
                RunEvent::ModelTurn { .. } => unreachable!(),
            })
            .collect();
        assert_eq!(kinds, ["start", "tool_start", "tool_end", "complete"]);

        // Second request carries the tool result paired with its call
        let second = &llm.recorded_requests()[1];
        let tool_turn = second.messages.last().unwrap();
        assert_eq!(tool_turn.role, Role::Tool);
        assert_eq!(tool_turn.tool_result_for.as_deref(), Some("c1"));

        let steps = status.recorded_steps();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].0, TEST_RUN);
        assert_eq!(steps[0].1.content["tool"], "retrieve_memory");
    }

    #[tokio::test]
    async fn test_parallel_calls_keep_order_and_errors() {
        let llm = Arc::new(MockLlmClient::new("test-model"));
        llm.queue_response(LlmResponse::tool_calls(vec![
            call("a", "search_tool", "rust"),
            call("b", "scrape_tool", "http://x"),
        ]));
        llm.queue_response(LlmResponse::text("done"));

        let (state, events, _) = TestRun::new("research")
            .llm(llm)
            .tools(memory_tools())
            .run()
            .await;

        let finished: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::ToolFinished {
                    tool_name,
                    is_error,
                    ..
                } => Some((tool_name.as_str(), *is_error)),
                _ => None,
            })
            .collect();
        assert_eq!(finished, [("search_tool", false), ("scrape_tool", true)]);

        let tool_turns: Vec<_> = state
            .history
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.tool_result_for.clone().unwrap())
            .collect();
        assert_eq!(tool_turns, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_revision_ceiling_forces_answer() {
        let llm = Arc::new(MockLlmClient::new("test-model"));
        for i in 0..5 {
            llm.queue_response(LlmResponse::tool_calls(vec![call(
                &format!("c{i}"),
                "search_tool",
                "again",
            )]));
        }

        let (state, events, status) = TestRun::new("loop forever")
            .llm(llm.clone())
            .tools(memory_tools())
            .max_revisions(2)
            .run()
            .await;

        assert_eq!(state.revision_number, 2);
        assert_eq!(llm.recorded_requests().len(), 3);
        let answer = state.final_answer.unwrap();
        assert!(answer.starts_with("I could not complete the task within the allotted 2 cycles."));
        assert!(matches!(
            state.phase,
            RunPhase::Terminal {
                outcome: RunOutcome::Completed
            }
        ));
        assert!(events.last().unwrap().is_terminal());
        assert_eq!(
            status.last_update(TEST_RUN).unwrap().status,
            RunStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_model_failure_fails_run() {
        let llm = Arc::new(MockLlmClient::new("test-model"));
        llm.queue_error(LlmError::server_error("upstream exploded"));

        let (state, events, status) = TestRun::new("anything").llm(llm).run().await;

        assert_eq!(state.error(), Some("upstream exploded"));
        assert_eq!(
            events.last().unwrap(),
            &RunEvent::RunFailed {
                error: "upstream exploded".to_string()
            }
        );
        let last = status.last_update(TEST_RUN).unwrap();
        assert_eq!(last.status, RunStatus::Failed);
        assert_eq!(last.error_message.as_deref(), Some("upstream exploded"));
        assert_eq!(last.output_result, Some(json!({"error": "upstream exploded"})));
    }

    #[tokio::test]
    async fn test_checkpoint_failure_does_not_abort() {
        let llm = Arc::new(MockLlmClient::new("test-model"));
        llm.queue_response(LlmResponse::text("still fine"));
        let store = Arc::new(FailingCheckpointStore::default());

        let (state, _, _) = TestRun::new("task")
            .llm(llm)
            .checkpoints(store.clone())
            .run()
            .await;

        assert_eq!(state.final_answer.as_deref(), Some("still fine"));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_checkpoints_track_each_cycle() {
        let llm = Arc::new(MockLlmClient::new("test-model"));
        llm.queue_response(LlmResponse::tool_calls(vec![call("c1", "search_tool", "q")]));
        llm.queue_response(LlmResponse::text("answer"));
        let store = Arc::new(MemoryCheckpointStore::new());

        TestRun::new("task")
            .llm(llm)
            .tools(memory_tools())
            .checkpoints(store.clone())
            .run()
            .await;

        let saved = store.list(TEST_THREAD).await.unwrap();
        let phases: Vec<_> = saved.iter().map(|c| c.metadata.phase.as_str()).collect();
        assert_eq!(phases, ["reasoning", "reasoning", "completed"]);
        assert_eq!(saved[1].metadata.revision, 1);
        assert_eq!(
            saved[2].parent_checkpoint_id.as_deref(),
            Some(saved[1].checkpoint_id.as_str())
        );
    }

    #[tokio::test]
    async fn test_usage_and_cost() {
        let llm = Arc::new(MockLlmClient::new("test-model"));
        llm.queue_response(
            LlmResponse::tool_calls(vec![call("c1", "search_tool", "q")])
                .with_usage(Usage::new(1_000_000, 0)),
        );
        llm.queue_response(LlmResponse::text("done").with_usage(Usage::new(0, 1_000_000)));

        let (_, _, status) = TestRun::new("task")
            .llm(llm)
            .tools(memory_tools())
            .pricing(Pricing::new(1.0, 2.0))
            .run()
            .await;

        let done = status.last_update(TEST_RUN).unwrap();
        assert_eq!(done.cost_usd, Some(3.0));
        let usage = &done.output_result.unwrap()["usage"];
        assert_eq!(usage["input_tokens"], 1_000_000);
        assert_eq!(usage["output_tokens"], 1_000_000);
    }

    #[tokio::test]
    async fn test_empty_response_uses_notice() {
        let llm = Arc::new(MockLlmClient::new("test-model"));
        llm.queue_response(LlmResponse::text("   "));

        let (state, _, _) = TestRun::new("task").llm(llm).run().await;
        assert_eq!(
            state.final_answer.as_deref(),
            Some(crate::state_machine::EMPTY_ANSWER_NOTICE)
        );
    }

    #[tokio::test]
    async fn test_resume_continues_from_state() {
        let mut resumed = RunState::new("task", 3);
        resumed.revision_number = 3;
        let llm = Arc::new(MockLlmClient::new("test-model"));
        llm.queue_response(LlmResponse::tool_calls(vec![call("c9", "search_tool", "q")]));

        let (state, _, _) = TestRun::new("ignored")
            .llm(llm)
            .tools(memory_tools())
            .state(resumed)
            .run()
            .await;

        // Already at the ceiling: the next tool request is answered, not run
        assert_eq!(state.revision_number, 3);
        assert!(state
            .final_answer
            .unwrap()
            .starts_with("I could not complete the task"));
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    #[tokio::test]
    async fn test_cancel_during_model_call() {
        let llm = Arc::new(DelayedMockLlmClient::new("slow", Duration::from_secs(30)));
        llm.queue_response(LlmResponse::text("too late"));
        let started_signal = llm.request_started.clone();

        let mut run = TestRun::new("task").llm(llm).start();
        started_signal.notified().await;
        run.cancel.cancel();

        let state = run.wait().await;
        assert_eq!(state.error(), Some(CANCELLED_ERROR));
        let events = run.events();
        assert_eq!(
            events.last().unwrap(),
            &RunEvent::RunFailed {
                error: CANCELLED_ERROR.to_string()
            }
        );
        assert_eq!(
            run.status.last_update(TEST_RUN).unwrap().status,
            RunStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_cancel_during_tools_closes_calls() {
        let llm = Arc::new(MockLlmClient::new("test-model"));
        llm.queue_response(LlmResponse::tool_calls(vec![
            call("a", "search_tool", "q"),
            call("b", "search_tool", "r"),
        ]));
        let tools = Arc::new(
            DelayedMockToolExecutor::new(Duration::from_secs(30))
                .with_tool("search_tool", ToolOutput::success("x")),
        );
        let started_signal = tools.execution_started.clone();

        let mut run = TestRun::new("task").llm(llm).tools(tools).start();
        started_signal.notified().await;
        run.cancel.cancel();

        let state = run.wait().await;
        assert_eq!(state.error(), Some(CANCELLED_ERROR));

        // Every call still has exactly one result
        assert!(crate::history::check_tool_pairing(&state.history).is_ok());
        let closed: Vec<_> = state
            .history
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|m| m.is_error));

        // Clients that saw the tools start also see them end
        let events = run.events();
        let started = events
            .iter()
            .filter(|e| matches!(e, RunEvent::ToolStarted { .. }))
            .count();
        let finished = events
            .iter()
            .filter(|e| matches!(e, RunEvent::ToolFinished { is_error: true, .. }))
            .count();
        assert_eq!(started, 2);
        assert_eq!(finished, started);
        assert!(matches!(events.last(), Some(RunEvent::RunFailed { .. })));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let llm = Arc::new(MockLlmClient::new("test-model"));
        llm.queue_response(LlmResponse::text("never requested"));
        let mut run = TestRun::new("task").llm(llm).start();
        run.cancel.cancel();

        let state = run.wait().await;
        // Either the cancel landed before the request or the answer won the race
        if state.error().is_some() {
            assert_eq!(state.error(), Some(CANCELLED_ERROR));
        } else {
            assert_eq!(state.final_answer.as_deref(), Some("never requested"));
        }
        assert!(run.events().last().unwrap().is_terminal());
    }
}
