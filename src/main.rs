use clap::Parser;
use doctown_corpus::pipeline::cluster::{ClusterConfig, Metric};
use doctown_corpus::pipeline::embed::EmbedConfig;
use doctown_corpus::pipeline::generate::SynthesisConfig;
use doctown_corpus::pipeline::write::WriterConfig;
use doctown_corpus::pipeline::{self, PipelineConfig, Providers};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing_subscriber::EnvFilter;

/// Build a clustered conversation corpus from a repository
#[derive(Debug, Parser)]
#[command(name = "doctown-corpus", version)]
struct Args {
    /// Repository root to read
    repo: PathBuf,

    /// Where the train/valid/stats files go
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Embedding cache directory
    #[arg(long, env = "EMBEDDING_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Use hash embeddings instead of the embedding API
    #[arg(long)]
    mock_embeddings: bool,

    /// JSON file mapping tags to keywords
    #[arg(long)]
    ontology: Option<PathBuf>,

    #[arg(long, default_value_t = 5)]
    min_cluster_size: usize,

    #[arg(long, default_value_t = 3)]
    min_samples: usize,

    #[arg(long, value_enum, default_value_t = Metric::Euclidean)]
    metric: Metric,

    /// Clusters synthesized concurrently
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Stop after this many clusters
    #[arg(long)]
    max_records: Option<usize>,

    #[arg(long, default_value_t = 0.1)]
    valid_ratio: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    println!("Doctown Corpus Builder\n");
    println!("Input: {}", args.repo.display());

    let synthesis = SynthesisConfig {
        concurrency: args.concurrency,
        max_records: args.max_records,
        ..SynthesisConfig::default()
    };

    // Ctrl-C stops new clusters; whatever finished still gets written
    let stop = synthesis.stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n⚠️  Interrupted, finishing in-flight clusters...");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let config = PipelineConfig {
        repo_root: args.repo.clone(),
        ontology_path: args.ontology.clone(),
        embed: EmbedConfig {
            cache_dir: args.cache_dir.clone(),
            ..EmbedConfig::default()
        },
        cluster: ClusterConfig {
            min_cluster_size: args.min_cluster_size,
            min_samples: args.min_samples,
            metric: args.metric,
        },
        synthesis,
        writer: WriterConfig {
            output_dir: args.output.clone(),
            valid_ratio: args.valid_ratio,
        },
        ..PipelineConfig::default()
    };

    if args.mock_embeddings {
        println!("Embeddings: mock (hash)");
    }
    println!("\n🟪 Running pipeline: discover → parse → tag → embed → cluster → synthesize → write");

    let providers = Providers::from_env(args.mock_embeddings);
    let summary = pipeline::run(&config, &providers).await?;

    println!("\n📊 Corpus Statistics:");
    println!("   • Files parsed: {}", summary.files);
    println!("   • Spans: {}", summary.spans);
    println!("   • Clusters: {} (+ {} singletons)", summary.clusters, summary.singletons);
    println!("   • Conversations attempted: {}", summary.attempted);
    println!("   • Failed: {}", summary.failed);
    println!("   • Duplicates dropped: {}", summary.duplicates);
    println!(
        "   • Written: {} ({} train / {} valid)",
        summary.written, summary.stats.train, summary.stats.valid
    );

    println!("\n✅ Output:");
    println!("   • {}", summary.paths.train.display());
    println!("   • {}", summary.paths.valid.display());
    println!("   • {}", summary.paths.stats.display());

    Ok(())
}
