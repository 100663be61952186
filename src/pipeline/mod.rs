// Pipeline module declarations
// Each phase is a separate module; `run` drives them in order

pub mod ingest;      // Phase 0: Discover files under the repository root
pub mod parse;       // Phase 1: Slice files into spans
pub mod ontology;    // Phase 2: Keyword tagging
pub mod embed;       // Phase 3: Embeddings + cache
pub mod cluster;     // Phase 4: HDBSCAN clustering
pub mod generate;    // Phase 5: Conversation synthesis + critique
pub mod postprocess; // Phase 5b: Redaction + dedupe
pub mod write;       // Phase 6: Train/valid split

use crate::error::PipelineError;
use crate::model::Span;
use crate::providers::{
    AnthropicConfig, AnthropicGenerator, EmbeddingProvider, HashEmbedder, OpenAiConfig,
    OpenAiEmbedder, OpenAiGenerator, TextGenerator,
};
use cluster::ClusterConfig;
use embed::{DiskCache, EmbedConfig, Embedder};
use generate::{SynthesisConfig, Synthesizer};
use ontology::OntologyTagger;
use parse::ParseConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use write::{DatasetPaths, DatasetStats, SynthesisCounts, Writer, WriterConfig};

/// Everything one run needs besides the external services
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub repo_root: PathBuf,
    /// Replaces the built-in keyword mapping when set
    pub ontology_path: Option<PathBuf>,
    pub parse: ParseConfig,
    pub embed: EmbedConfig,
    pub cluster: ClusterConfig,
    pub synthesis: SynthesisConfig,
    pub writer: WriterConfig,
}

/// External services injected into the stages
#[derive(Clone)]
pub struct Providers {
    pub embedding: Arc<dyn EmbeddingProvider>,
    pub generator: Arc<dyn TextGenerator>,
    pub critic: Arc<dyn TextGenerator>,
}

impl Providers {
    /// Anthropic for synthesis, OpenAI for critique and embeddings, all configured from env.
    /// `use_mock_embeddings` swaps the embedding client for [`HashEmbedder`].
    pub fn from_env(use_mock_embeddings: bool) -> Self {
        let openai = OpenAiConfig::default();
        let embedding: Arc<dyn EmbeddingProvider> = if use_mock_embeddings {
            Arc::new(HashEmbedder::default())
        } else {
            Arc::new(OpenAiEmbedder::new(openai.clone()))
        };

        Self {
            embedding,
            generator: Arc::new(AnthropicGenerator::new(AnthropicConfig::default())),
            critic: Arc::new(OpenAiGenerator::new(openai)),
        }
    }
}

/// What a run produced
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub files: usize,
    pub spans: usize,
    pub clusters: usize,
    pub singletons: usize,
    pub attempted: usize,
    pub failed: usize,
    /// Records dropped as duplicates after redaction
    pub duplicates: usize,
    /// Records written after post-processing
    pub written: usize,
    pub stats: DatasetStats,
    pub paths: DatasetPaths,
}

/// Run discovery through writing for one repository
pub async fn run(config: &PipelineConfig, providers: &Providers) -> Result<RunSummary, PipelineError> {
    let files = ingest::discover(&config.repo_root)?;
    info!(files = files.len(), root = %config.repo_root.display(), "discovered files");

    let documents = parse::parse_all_files(&files, &config.parse);
    let mut spans: Vec<Span> = documents.into_iter().flat_map(|d| d.spans).collect();

    let tagger = match &config.ontology_path {
        Some(path) => OntologyTagger::from_json_file(path)?,
        None => OntologyTagger::default(),
    };
    tagger.tag(&mut spans);

    let mut embedder = Embedder::new(providers.embedding.clone());
    if let Some(dir) = &config.embed.cache_dir {
        embedder = embedder.with_cache(Arc::new(DiskCache::new(dir)));
    }
    let embeddings = embedder.embed_with_retry(&spans, &config.embed).await?;

    let clusters = cluster::cluster_spans(&spans, &embeddings, &config.cluster)?;
    let singletons = clusters.iter().filter(|c| c.is_singleton()).count();

    let synthesizer = Synthesizer::new(
        providers.generator.clone(),
        providers.critic.clone(),
        config.synthesis.clone(),
    );
    let report = synthesizer.generate(&clusters).await;

    let failed = report.failures.len();
    let processed = postprocess::postprocess(report.records);
    let counts = SynthesisCounts {
        attempted: report.attempted,
        failed,
        duplicates: processed.duplicates,
    };
    let writer = Writer::new(config.writer.clone());
    let stats = writer.write(&processed.records, counts)?;

    Ok(RunSummary {
        files: files.len(),
        spans: spans.len(),
        clusters: clusters.len() - singletons,
        singletons,
        attempted: report.attempted,
        failed,
        duplicates: processed.duplicates,
        written: processed.records.len(),
        stats,
        paths: writer.paths(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.parse.min_block_chars, 400);
        assert_eq!(config.cluster.min_cluster_size, 5);
        assert_eq!(config.cluster.min_samples, 3);
        assert_eq!(config.synthesis.concurrency, 4);
        assert_eq!(config.writer.valid_ratio, 0.1);
    }

    #[test]
    fn mock_flag_selects_the_hash_embedder() {
        let mock = Providers::from_env(true);
        assert_eq!(mock.embedding.model(), HashEmbedder::default().model());

        let live = Providers::from_env(false);
        assert_ne!(live.embedding.model(), HashEmbedder::default().model());
    }
}
