//! Fetch a web page and return its visible text

use super::{parse_input, Tool, ToolContext, ToolOutput, DEFAULT_TOOL_TIMEOUT};
use async_trait::async_trait;
use scraper::Html;
use serde::Deserialize;
use serde_json::{json, Value};

const MAX_CHARS: usize = 5000;
const SKIPPED_ELEMENTS: [&str; 4] = ["script", "style", "noscript", "template"];

pub const EMPTY_PAGE: &str = "The webpage content was empty.";

#[derive(Debug, Deserialize)]
struct ScrapeInput {
    url: String,
}

pub struct ScrapeTool;

/// Visible text of an HTML document: text nodes outside script-like
/// elements, trimmed and joined with single spaces.
pub fn extract_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut parts: Vec<&str> = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| SKIPPED_ELEMENTS.contains(&e.name()))
        });
        if !hidden {
            parts.extend(text.split_whitespace());
        }
    }
    parts.join(" ")
}

async fn fetch(url: &str) -> Result<String, reqwest::Error> {
    let client = reqwest::Client::builder()
        .timeout(DEFAULT_TOOL_TIMEOUT)
        .build()?;
    client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
}

#[async_trait]
impl Tool for ScrapeTool {
    fn name(&self) -> &'static str {
        "scrape_tool"
    }

    fn description(&self) -> String {
        "Fetch a web page and return its text content (truncated). Use on URLs found by \
         search_tool when the snippet is not enough."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["url"],
            "properties": {
                "url": {
                    "type": "string",
                    "description": "Absolute http(s) URL of the page"
                }
            }
        })
    }

    async fn run(&self, input: Value, _ctx: ToolContext) -> ToolOutput {
        let input: ScrapeInput = match parse_input(input) {
            Ok(input) => input,
            Err(out) => return out,
        };
        let html = match fetch(&input.url).await {
            Ok(html) => html,
            Err(e) => return ToolOutput::error(format!("Failed to scrape {}: {e}", input.url)),
        };

        let text = extract_text(&html);
        if text.is_empty() {
            return ToolOutput::success(EMPTY_PAGE);
        }
        ToolOutput::success(text.chars().take(MAX_CHARS).collect::<String>())
    }
}
