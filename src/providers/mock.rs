// providers/mock.rs
// Deterministic offline embeddings derived from a content hash

use super::EmbeddingProvider;
use crate::error::ProviderError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

pub const MOCK_DIMENSION: usize = 384;

/// Embeds text by hashing it. Identical text always maps to the identical
/// unit vector; nothing semantic survives.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(MOCK_DIMENSION)
    }
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = Vec::with_capacity(self.dimension);
        let mut block: u32 = 0;

        // Chain SHA-256 blocks until the vector is full
        while vector.len() < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(block.to_le_bytes());
            hasher.update(text.as_bytes());
            let hash = hasher.finalize();

            for chunk in hash.chunks(4) {
                if vector.len() == self.dimension {
                    break;
                }
                let val = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                vector.push((val % 1000) as f32 / 1000.0 - 0.5);
            }
            block += 1;
        }

        let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for v in &mut vector {
                *v /= magnitude;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn model(&self) -> &str {
        "mock-embeddings-v1"
    }
}
