// error.rs
// Error taxonomy for every pipeline phase

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by external embedding / generation providers
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Chat completion failed: {0}")]
    Chat(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Missing credentials: set {0}")]
    MissingCredentials(&'static str),
}

/// Per-file parse failures. Never fatal: the parser turns them into empty documents.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not valid UTF-8")]
    Decode(PathBuf),
}

/// Embedding-cache storage failures
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt cache entry: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Cache lock poisoned by a panicked writer")]
    Poisoned,
}

/// Embedding phase failures. These always propagate to the caller.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("Embedding provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Provider returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },

    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Embedding for input {index} contains non-finite values")]
    NonFinite { index: usize },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Clustering phase failures
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Span count ({spans}) does not match embedding rows ({rows})")]
    RowMismatch { spans: usize, rows: usize },

    #[error("Invalid clustering config: {0}")]
    InvalidConfig(String),

    #[error("HDBSCAN failed: {0}")]
    Density(String),
}

/// Per-cluster synthesis failures, folded into the synthesis report
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("Generation call failed: {0}")]
    Generation(#[from] ProviderError),

    #[error("Response is not valid JSON: {0}")]
    MalformedJson(String),

    #[error("Response does not match the conversation schema: {0}")]
    Schema(String),
}

/// Output serialization failures
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level failure of a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to read repository {path}: {source}")]
    Discover {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load ontology from {path}: {reason}")]
    Ontology { path: PathBuf, reason: String },

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Write(#[from] WriteError),
}
