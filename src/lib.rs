//! Turns a source repository into a clustered, LLM-synthesized conversation corpus.
//!
//! Phases run strictly in order: discover → parse → tag → embed → cluster →
//! synthesize → post-process → write. See [`pipeline::run`].

pub mod error;
pub mod model;
pub mod pipeline;
pub mod providers;

pub use error::PipelineError;
pub use model::{Cluster, ConversationRecord, ConversationTurn, Evidence, ParsedDocument, Span, SpanKind};
pub use pipeline::{run, PipelineConfig, Providers, RunSummary};
