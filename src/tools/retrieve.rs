//! Knowledge-base retrieval through backend-core's document search

use super::{parse_input, Tool, ToolContext, ToolOutput};
use crate::config::BackendConfig;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
const DIRECT_ANSWER_HITS: usize = 3;
const DIRECT_ANSWER_CHARS: usize = 800;

pub const NO_MEMORY_RESULTS: &str = "No relevant documents found in memory.";
pub const NO_KNOWLEDGE_BASE_RESULTS: &str = "No relevant documents found in the knowledge base.";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MemoryHit {
    #[serde(default)]
    pub document_title: String,
    #[serde(default)]
    pub text_content: String,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<MemoryHit>,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("{status} {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("memory service is not configured")]
    NotConfigured,
}

/// Client for `POST {backend}/documents/search/`
pub struct MemoryClient {
    client: reqwest::Client,
    search_url: String,
    secret: String,
}

impl MemoryClient {
    pub fn new(config: &BackendConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(SEARCH_TIMEOUT).build()?,
            search_url: format!("{}/documents/search/", config.url),
            secret: config.secret.clone(),
        })
    }

    /// Ranked hits for `query`, best first
    pub async fn search(&self, query: &str) -> Result<Vec<MemoryHit>, MemoryError> {
        let response = self
            .client
            .post(&self.search_url)
            .header("X-Internal-Secret", &self.secret)
            .json(&json!({ "query": query }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MemoryError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let body: SearchResponse = response.json().await?;
        Ok(body.results)
    }
}

/// Hits as the agent sees them: one Title/Content/Score block per document
pub fn format_for_agent(hits: &[MemoryHit]) -> String {
    if hits.is_empty() {
        return NO_MEMORY_RESULTS.to_string();
    }
    hits.iter()
        .map(|h| {
            format!(
                "Title: {}\nContent: {}\nScore: {:.2}",
                h.document_title, h.text_content, h.score
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

/// Hits as a direct answer: the top three, each excerpt capped
pub fn format_direct_answer(hits: &[MemoryHit]) -> String {
    if hits.is_empty() {
        return NO_KNOWLEDGE_BASE_RESULTS.to_string();
    }
    hits.iter()
        .take(DIRECT_ANSWER_HITS)
        .map(|h| {
            let excerpt: String = h.text_content.chars().take(DIRECT_ANSWER_CHARS).collect();
            format!(
                "**From '{}'** (relevance: {:.1}%):\n\n{excerpt}\n",
                h.document_title,
                h.score * 100.0
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n\n")
}

#[derive(Debug, Deserialize)]
struct RetrieveInput {
    query: String,
}

pub struct RetrieveMemoryTool {
    client: Option<Arc<MemoryClient>>,
}

impl RetrieveMemoryTool {
    pub fn new(client: Option<Arc<MemoryClient>>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for RetrieveMemoryTool {
    fn name(&self) -> &'static str {
        "retrieve_memory"
    }

    fn description(&self) -> String {
        "Search the organization's uploaded documents (the knowledge base) for passages relevant \
         to a query. Use this first for anything that may be covered by internal files."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look for in the knowledge base"
                }
            }
        })
    }

    async fn run(&self, input: Value, _ctx: ToolContext) -> ToolOutput {
        let input: RetrieveInput = match parse_input(input) {
            Ok(input) => input,
            Err(out) => return out,
        };
        let Some(client) = &self.client else {
            return ToolOutput::error(format!(
                "Error connecting to memory service: {}",
                MemoryError::NotConfigured
            ));
        };

        match client.search(&input.query).await {
            Ok(hits) => ToolOutput::success(format_for_agent(&hits)),
            Err(e @ MemoryError::Status { .. }) => {
                ToolOutput::error(format!("Error retrieving memory: {e}"))
            }
            Err(e) => ToolOutput::error(format!("Error connecting to memory service: {e}")),
        }
    }
}
