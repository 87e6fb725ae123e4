//! Chat-completion client for LLM-assisted identification and classification
//!
//! Speaks the OpenAI-compatible chat API (Ollama serves the same shape).
//! Output parsing is heuristic, not a guaranteed grammar: responses may wrap
//! JSON in markdown code fences, sometimes nested, so extraction unwraps
//! fences up to a fixed bound and hard-fails on anything still unparseable.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// How many layers of code fencing we are willing to peel off
const MAX_FENCE_UNWRAPS: usize = 3;

/// Configuration for the chat-completion client
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            model: "qwen2.5:7b".to_string(),
            api_key: None,
            timeout_seconds: 30,
            temperature: 0.1,
            max_tokens: 512,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Client for a chat-completion endpoint
pub struct LlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, config })
    }

    /// Send a single-user-message completion and return the raw response text
    pub async fn complete(&self, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            stream: false,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let url = format!("{}/v1/chat/completions", self.config.url.trim_end_matches('/'));
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .context("Failed to send request to LLM endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM endpoint error: {} - {}", status, body);
        }

        let chat: ChatResponse = response
            .json()
            .await
            .context("Failed to parse LLM response body")?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .context("LLM response contained no choices")?;

        debug!(model = %self.config.model, chars = content.len(), "LLM completion received");
        Ok(content)
    }
}

/// Extract a JSON value from a response that may be wrapped in markdown code
/// fences, possibly nested. Best-effort: unwraps at most [`MAX_FENCE_UNWRAPS`]
/// layers, then falls back to slicing out the outermost object or array.
pub fn extract_json(response: &str) -> Result<String> {
    let mut text = response.trim();

    for _ in 0..MAX_FENCE_UNWRAPS {
        if !text.starts_with("```") {
            break;
        }
        let without_open = match text.find('\n') {
            Some(idx) => &text[idx + 1..],
            None => break,
        };
        text = match without_open.rfind("```") {
            Some(idx) => without_open[..idx].trim(),
            None => without_open.trim(),
        };
    }

    if text.starts_with('{') || text.starts_with('[') {
        return Ok(text.to_string());
    }

    // Prose around the payload: slice out the outermost object or array
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close)) {
            if start < end {
                return Ok(text[start..=end].to_string());
            }
        }
    }

    warn!("No JSON found in LLM response: {}", text);
    anyhow::bail!("no valid JSON found in LLM response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_raw() {
        let input = r#"{"title": "Akira", "year": 1988}"#;
        assert_eq!(extract_json(input).unwrap(), input);
    }

    #[test]
    fn test_extract_json_fenced() {
        let input = "```json\n{\"title\": \"Akira\"}\n```";
        assert_eq!(extract_json(input).unwrap(), r#"{"title": "Akira"}"#);
    }

    #[test]
    fn test_extract_json_nested_fences() {
        let input = "```\n```json\n{\"title\": \"Akira\"}\n```\n```";
        assert_eq!(extract_json(input).unwrap(), r#"{"title": "Akira"}"#);
    }

    #[test]
    fn test_extract_json_with_prose() {
        let input = "Here is the result:\n{\"title\": \"Akira\"}\nHope that helps!";
        assert_eq!(extract_json(input).unwrap(), r#"{"title": "Akira"}"#);
    }

    #[test]
    fn test_extract_json_array() {
        let input = "```json\n[{\"type\": \"main\"}]\n```";
        assert_eq!(extract_json(input).unwrap(), r#"[{"type": "main"}]"#);
    }

    #[test]
    fn test_extract_json_rejects_garbage() {
        assert!(extract_json("I could not classify this folder.").is_err());
    }
}
