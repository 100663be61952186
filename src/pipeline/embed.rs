// embed.rs
// Phase 3: Span embeddings with a content-addressed cache

use crate::error::{CacheError, EmbedError};
use crate::model::Span;
use crate::providers::EmbeddingProvider;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Inputs longer than this are cut before submission
pub const MAX_INPUT_CHARS: usize = 6000;

/// Configuration for the embedding phase
#[derive(Debug, Clone)]
pub struct EmbedConfig {
    /// Where vectors are persisted; `None` disables caching
    pub cache_dir: Option<PathBuf>,

    /// Extra attempts after a failed batch
    pub max_retries: u32,

    /// Delay before retry `n` is `n * retry_backoff`
    pub retry_backoff: Duration,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::var("EMBEDDING_CACHE_DIR").ok().map(PathBuf::from),
            max_retries: 2,
            retry_backoff: Duration::from_secs(2),
        }
    }
}

/// A persisted vector plus enough provenance to audit it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub embedding: Vec<f32>,
    pub source: String,
    pub lines: String,
    #[serde(default)]
    pub model: String,
}

pub trait EmbeddingCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;
    fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError>;
}

/// One JSON file per key under a directory
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl EmbeddingCache for DiskCache {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(key);
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&json) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                // Overwritten on the next put
                warn!(path = %path.display(), error = %e, "ignoring corrupt cache entry");
                Ok(None)
            }
        }
    }

    fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)?;

        let tmp = self.dir.join(format!(
            ".{}.{}.{}.tmp",
            key,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, serde_json::to_vec(entry)?)?;
        if let Err(e) = fs::rename(&tmp, self.entry_path(key)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EmbeddingCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        entries.insert(key.to_string(), entry.clone());
        Ok(())
    }
}

/// SHA-256 over `path:start-end`, hex encoded
pub fn cache_key(span: &Span) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", span.path.replace('\\', "/"), span.line_range()).as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// First `max` characters of `text`, cut on a char boundary
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Option<Arc<dyn EmbeddingCache>>,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Embed every span; row `i` belongs to `spans[i]`.
    ///
    /// Cached rows are reused. All misses go to the provider in a single batch,
    /// and the batch is all-or-nothing: on any failure nothing is written to
    /// the cache and the error is returned.
    pub async fn embed(&self, spans: &[Span]) -> Result<Array2<f32>, EmbedError> {
        if spans.is_empty() {
            return Ok(Array2::zeros((0, 0)));
        }

        let keys: Vec<String> = spans.iter().map(cache_key).collect();
        let mut rows: Vec<Option<Vec<f32>>> = Vec::with_capacity(spans.len());

        for key in &keys {
            let hit = match &self.cache {
                Some(cache) => cache
                    .get(key)?
                    .filter(|entry| entry.model.is_empty() || entry.model == self.provider.model())
                    .map(|entry| entry.embedding),
                None => None,
            };
            rows.push(hit);
        }

        let misses: Vec<usize> = (0..spans.len()).filter(|&i| rows[i].is_none()).collect();
        debug!(
            total = spans.len(),
            cached = spans.len() - misses.len(),
            misses = misses.len(),
            "embedding spans"
        );

        if !misses.is_empty() {
            let texts: Vec<String> = misses
                .iter()
                .map(|&i| truncate_chars(&spans[i].content, MAX_INPUT_CHARS).to_string())
                .collect();

            let vectors = self.provider.embed_batch(&texts).await?;
            if vectors.len() != texts.len() {
                return Err(EmbedError::CountMismatch {
                    expected: texts.len(),
                    got: vectors.len(),
                });
            }
            for (&i, vector) in misses.iter().zip(vectors) {
                rows[i] = Some(vector);
            }
        }

        let rows: Vec<Vec<f32>> = rows.into_iter().flatten().collect();
        let dim = validate_rows(&rows)?;

        if let Some(cache) = &self.cache {
            for &i in &misses {
                let entry = CacheEntry {
                    embedding: rows[i].clone(),
                    source: spans[i].path.clone(),
                    lines: spans[i].line_range(),
                    model: self.provider.model().to_string(),
                };
                cache.put(&keys[i], &entry)?;
            }
        }

        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        Array2::from_shape_vec((spans.len(), dim), flat).map_err(|_| EmbedError::DimensionMismatch {
            expected: dim,
            got: 0,
        })
    }

    /// `embed`, retried with linear backoff
    pub async fn embed_with_retry(
        &self,
        spans: &[Span],
        config: &EmbedConfig,
    ) -> Result<Array2<f32>, EmbedError> {
        let mut attempt = 0;
        loop {
            match self.embed(spans).await {
                Ok(matrix) => return Ok(matrix),
                Err(e) if attempt < config.max_retries => {
                    attempt += 1;
                    let delay = config.retry_backoff * attempt;
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "embedding failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// All rows share one non-zero dimension and hold only finite values
fn validate_rows(rows: &[Vec<f32>]) -> Result<usize, EmbedError> {
    let dim = rows.first().map(|r| r.len()).unwrap_or(0);
    if dim == 0 {
        return Err(EmbedError::DimensionMismatch {
            expected: 1,
            got: 0,
        });
    }

    for (index, row) in rows.iter().enumerate() {
        if row.len() != dim {
            return Err(EmbedError::DimensionMismatch {
                expected: dim,
                got: row.len(),
            });
        }
        if row.iter().any(|v| !v.is_finite()) {
            return Err(EmbedError::NonFinite { index });
        }
    }

    info!(rows = rows.len(), dimension = dim, "embeddings ready");
    Ok(dim)
}
