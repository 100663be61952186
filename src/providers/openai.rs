// providers/openai.rs
// OpenAI chat (critique pass) and OpenAI-compatible embeddings

use super::{EmbeddingProvider, GenerationRequest, TextGenerator};
use crate::error::ProviderError;
use ::openai::chat::{
    ChatCompletion, ChatCompletionMessage, ChatCompletionMessageRole, ChatCompletionResponseFormat,
};
use ::openai::Credentials;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/";

/// Connection settings shared by the chat and embedding clients
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    /// Chat model used for critique
    pub model: String,
    pub embedding_model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        // The openai crate reads OPENAI_KEY; accept the more common name too
        let api_key = std::env::var("OPENAI_API_KEY")
            .or_else(|_| std::env::var("OPENAI_KEY"))
            .unwrap_or_default();

        Self {
            api_key,
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            embedding_model: std::env::var("OPENAI_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-large".to_string()),
        }
    }
}

impl OpenAiConfig {
    fn require_key(&self) -> Result<(), ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::MissingCredentials("OPENAI_API_KEY"));
        }
        Ok(())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Chat completions through the `openai` crate
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    config: OpenAiConfig,
    credentials: Credentials,
}

impl OpenAiGenerator {
    pub fn new(config: OpenAiConfig) -> Self {
        let credentials = Credentials::new(config.api_key.clone(), config.base_url.clone());
        Self {
            config,
            credentials,
        }
    }
}

fn message(role: ChatCompletionMessageRole, content: &str) -> ChatCompletionMessage {
    ChatCompletionMessage {
        role,
        content: Some(content.to_string()),
        name: None,
        function_call: None,
        tool_call_id: None,
        tool_calls: None,
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn complete(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        self.config.require_key()?;

        let messages = vec![
            message(ChatCompletionMessageRole::System, &request.system),
            message(ChatCompletionMessageRole::User, &request.prompt),
        ];

        let mut builder = ChatCompletion::builder(&self.config.model, messages)
            .credentials(self.credentials.clone())
            .max_completion_tokens(request.max_tokens)
            .temperature(request.temperature);
        if request.json_mode {
            builder = builder.response_format(ChatCompletionResponseFormat::json_object());
        }

        let response = builder
            .create()
            .await
            .map_err(|e| ProviderError::Chat(format!("OpenAI API error: {}", e)))?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| ProviderError::InvalidResponse("No response content from OpenAI".into()))
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

/// `POST {base}/embeddings` over reqwest
#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiEmbedder {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.config.require_key()?;

        let body = json!({
            "model": self.config.embedding_model,
            "input": texts,
        });

        debug!(inputs = texts.len(), model = %self.config.embedding_model, "requesting embeddings");
        let response = self
            .client
            .post(self.config.endpoint("embeddings"))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
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
        parse_embeddings(&data)
    }

    fn model(&self) -> &str {
        &self.config.embedding_model
    }
}

/// Pull `data[i].embedding` out of an embeddings response, honouring `index` when present
fn parse_embeddings(data: &Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let items = data["data"]
        .as_array()
        .ok_or_else(|| ProviderError::InvalidResponse("missing data array".into()))?;

    let mut indexed = Vec::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        let index = item["index"].as_u64().map(|i| i as usize).unwrap_or(position);
        let vector = item["embedding"]
            .as_array()
            .ok_or_else(|| {
                ProviderError::InvalidResponse(format!("item {} has no embedding", position))
            })?
            .iter()
            .map(|v| {
                v.as_f64().map(|f| f as f32).ok_or_else(|| {
                    ProviderError::InvalidResponse(format!("item {} has a non-numeric value", position))
                })
            })
            .collect::<Result<Vec<f32>, _>>()?;
        indexed.push((index, vector));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embeddings_are_reordered_by_index() {
        let data = json!({
            "data": [
                {"index": 1, "embedding": [0.5, 0.5]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_embeddings(&data).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
    }

    #[test]
    fn malformed_embedding_payload_is_rejected() {
        let data = json!({"data": [{"embedding": ["x"]}]});
        assert!(matches!(
            parse_embeddings(&data),
            Err(ProviderError::InvalidResponse(_))
        ));
        assert!(parse_embeddings(&json!({"error": "nope"})).is_err());
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let config = OpenAiConfig {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-large".to_string(),
        };
        let embedder = OpenAiEmbedder::new(config);
        let err = embedder.embed_batch(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, ProviderError::MissingCredentials(_)));
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        let config = OpenAiConfig {
            api_key: "k".into(),
            base_url: "http://localhost:8080/v1/".into(),
            model: "m".into(),
            embedding_model: "e".into(),
        };
        assert_eq!(config.endpoint("embeddings"), "http://localhost:8080/v1/embeddings");
    }
}
