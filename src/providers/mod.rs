// providers/mod.rs
// External embedding and text-generation services, injected into the pipeline stages

pub mod anthropic;
pub mod mock;
pub mod openai;

use crate::error::ProviderError;
use async_trait::async_trait;

pub use self::anthropic::{AnthropicConfig, AnthropicGenerator};
pub use self::mock::HashEmbedder;
pub use self::openai::{OpenAiConfig, OpenAiEmbedder, OpenAiGenerator};

/// Maps a batch of texts to vectors, one per input, in input order
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    /// Model identifier, recorded alongside cached vectors
    fn model(&self) -> &str;
}

/// A single prompt → completion call
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the backend for a JSON object where it supports it
    pub json_mode: bool,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, request: &GenerationRequest) -> Result<String, ProviderError>;

    fn model(&self) -> &str;
}
