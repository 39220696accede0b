//! Web search against a DuckDuckGo-style HTML endpoint

use super::{parse_input, Tool, ToolContext, ToolOutput, DEFAULT_TOOL_TIMEOUT};
use async_trait::async_trait;
use reqwest::Url;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::{json, Value};

const MAX_RESULTS: usize = 3;
const USER_AGENT: &str = "Mozilla/5.0 (compatible; research-agent/0.1)";

pub const NO_SEARCH_RESULTS: &str = "No web search results found.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Deserialize)]
struct SearchInput {
    query: String,
}

pub struct SearchTool {
    base_url: String,
    client: reqwest::Client,
}

impl SearchTool {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TOOL_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { base_url, client }
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, String> {
        let html = self
            .client
            .get(&self.base_url)
            .query(&[("q", query)])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| e.to_string())?
            .text()
            .await
            .map_err(|e| e.to_string())?;
        parse_results(&html, MAX_RESULTS)
    }
}

fn selector(css: &str) -> Result<Selector, String> {
    Selector::parse(css).map_err(|e| format!("invalid selector {css}: {e}"))
}

/// Extract up to `limit` results from a search results page
pub fn parse_results(html: &str, limit: usize) -> Result<Vec<SearchHit>, String> {
    let result_sel = selector(".result")?;
    let title_sel = selector("a.result__a")?;
    let snippet_sel = selector(".result__snippet")?;

    let document = Html::parse_document(html);
    let hits = document
        .select(&result_sel)
        .filter_map(|result| {
            let link = result.select(&title_sel).next()?;
            let href = link.value().attr("href")?;
            let snippet = result
                .select(&snippet_sel)
                .next()
                .map(|s| collapse_whitespace(&s.text().collect::<String>()))
                .unwrap_or_default();
            Some(SearchHit {
                title: collapse_whitespace(&link.text().collect::<String>()),
                url: resolve_link(href),
                snippet,
            })
        })
        .take(limit)
        .collect();
    Ok(hits)
}

/// Unwrap DuckDuckGo's `/l/?uddg=<target>` redirect links
fn resolve_link(href: &str) -> String {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    Url::parse(&absolute)
        .ok()
        .filter(|url| url.path().starts_with("/l/"))
        .and_then(|url| {
            url.query_pairs()
                .find(|(key, _)| key == "uddg")
                .map(|(_, target)| target.into_owned())
        })
        .unwrap_or(absolute)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn format_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return NO_SEARCH_RESULTS.to_string();
    }
    hits.iter()
        .map(|h| format!("{}\n{}\n{}", h.title, h.url, h.snippet))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &'static str {
        "search_tool"
    }

    fn description(&self) -> String {
        "Search the web. Returns the top results with title, URL and a short snippet. \
         Use when the knowledge base has nothing relevant."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Web search query"
                }
            }
        })
    }

    async fn run(&self, input: Value, _ctx: ToolContext) -> ToolOutput {
        let input: SearchInput = match parse_input(input) {
            Ok(input) => input,
            Err(out) => return out,
        };
        match self.search(&input.query).await {
            Ok(hits) => ToolOutput::success(format_hits(&hits)),
            Err(e) => ToolOutput::error(format!("Search failed: {e}")),
        }
    }
}
