// providers/anthropic.rs
// Anthropic Messages API client (primary synthesis pass)

use super::{GenerationRequest, TextGenerator};
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
    pub url: String,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            model: std::env::var("ANTHROPIC_MODEL")
                .unwrap_or_else(|_| "claude-3-5-sonnet-latest".to_string()),
            url: MESSAGES_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnthropicGenerator {
    client: Client,
    config: AnthropicConfig,
}

impl AnthropicGenerator {
    pub fn new(config: AnthropicConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl TextGenerator for AnthropicGenerator {
    async fn complete(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::MissingCredentials("ANTHROPIC_API_KEY"));
        }

        // The Messages API has no JSON mode; the system prompt carries that instruction
        let body = json!({
            "model": self.config.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "system": request.system,
            "messages": [{"role": "user", "content": request.prompt}],
        });

        let response = self
            .client
            .post(&self.config.url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let data: Value = response.json().await?;
        extract_text(&data)
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

/// Concatenate the text blocks of a Messages response
fn extract_text(data: &Value) -> Result<String, ProviderError> {
    let blocks = data["content"]
        .as_array()
        .ok_or_else(|| ProviderError::InvalidResponse("missing content array".into()))?;

    let text: String = blocks
        .iter()
        .filter(|b| b["type"].as_str().map_or(true, |t| t == "text"))
        .filter_map(|b| b["text"].as_str())
        .collect();

    if text.trim().is_empty() {
        return Err(ProviderError::InvalidResponse(
            "No text content from Anthropic".into(),
        ));
    }
    Ok(text)
}
