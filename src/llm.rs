//! Completion service used for PR descriptions and memory compression.
//!
//! The orchestrator only needs one operation — `complete(prompt, system)` —
//! so that is the whole trait. The production implementation talks to the
//! Anthropic Messages API over HTTPS.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Generous bound for long completions (PR descriptions, memory merges).
const COMPLETION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

pub const PR_DESCRIPTION_SYSTEM: &str = "You are writing a pull request description. Based on the story and changes, write:\n\
     1. A brief summary of what was done\n\
     2. Key changes (bullet points)\n\
     3. Testing notes\n\
     Be concise. Use markdown formatting.";

pub const MEMORY_COMPRESSION_SYSTEM: &str = "You are managing a project memory file. Your job is to merge new facts \
     into the existing memory while keeping it concise and well-organized.\n\n\
     Rules:\n\
     - Preserve ALL important facts (architecture decisions, conventions, gotchas)\n\
     - Remove redundant or outdated information\n\
     - Keep the same markdown structure and sections\n\
     - Be concise — compress, don't just append\n\
     - Update dates and status fields\n\
     - Keep the file under 500 lines";

#[async_trait]
pub trait Completions: Send + Sync {
    /// Send a prompt with an optional system prompt, returning the text of
    /// the first content block.
    async fn complete(&self, prompt: &str, system: &str) -> Result<String>;
}

/// Anthropic Messages API client.
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            api_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    /// Point the client at a different endpoint (tests).
    #[allow(dead_code)]
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Completions for AnthropicClient {
    async fn complete(&self, prompt: &str, system: &str) -> Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "messages": [{"role": "user", "content": prompt}],
        });
        if !system.is_empty() {
            body["system"] = serde_json::Value::String(system.to_string());
        }

        let resp = self
            .http
            .post(&self.api_url)
            .timeout(COMPLETION_TIMEOUT)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("Failed to send completion request")?
            .error_for_status()
            .context("Completion API returned error status")?
            .json::<MessagesResponse>()
            .await
            .context("Failed to parse completion response")?;

        if let Some(usage) = &resp.usage {
            tracing::info!(
                model = %self.model,
                input_tokens = usage.input_tokens.unwrap_or(0),
                output_tokens = usage.output_tokens.unwrap_or(0),
                "llm.completed"
            );
        }

        resp.content
            .into_iter()
            .find_map(|block| block.text)
            .context("Completion response had no text content")
    }
}

/// Build the prompt asking for a PR description.
pub fn pr_description_prompt(
    title: &str,
    body: &str,
    files_changed: &[String],
    test_output: &str,
) -> String {
    let mut test_excerpt = test_output;
    if test_excerpt.len() > 2000 {
        // Keep the head; test runners put the summary counts up front or the
        // failures early.
        let mut end = 2000;
        while !test_excerpt.is_char_boundary(end) {
            end -= 1;
        }
        test_excerpt = &test_excerpt[..end];
    }
    format!(
        "Story: {}\n\nDescription: {}\n\nFiles changed: {}\n\nTest output:\n{}",
        title,
        body,
        files_changed.join(", "),
        test_excerpt
    )
}
