use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use citypulse_core::domain::{Source, TrustTier};
use citypulse_core::storage::{InMemoryStorage, Storage};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use citypulse_ingest::config::PipelineConfig;
use citypulse_ingest::observability;
use citypulse_ingest::pipeline::orchestrator::IngestOrchestrator;
use citypulse_ingest::pipeline::processing::normalize::{
    ExtractionNormalizer, ExtractionService, RawRecord,
};
use citypulse_ingest::pipeline::processing::taxonomy::TaxonomyConfig;

#[derive(Parser)]
#[command(name = "citypulse-ingest")]
#[command(about = "CityPulse ingestion pipeline driver")]
#[command(version = "0.1.0")]
struct Cli {
    /// Optional pipeline config TOML; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dry-run a batch of raw records (JSON lines) through the full
    /// pipeline against in-memory storage and print the crawl summary
    Run {
        /// Source id to attribute the records to
        #[arg(long)]
        source_id: String,
        /// Path to a JSON-lines file of raw records
        #[arg(long)]
        records: PathBuf,
        /// Trust tier for the source: unvetted, standard, established, verified
        #[arg(long, default_value = "standard")]
        trust_tier: String,
    },
    /// Validate a records file through the extraction normalizer only,
    /// reporting acceptance and rejection counts
    Check {
        /// Path to a JSON-lines file of raw records
        #[arg(long)]
        records: PathBuf,
    },
}

/// The real extraction model is wired in by the deployment; the CLI only
/// accepts records that already carry a structured guess.
struct NoExtractionService;

#[async_trait]
impl ExtractionService for NoExtractionService {
    async fn extract(&self, _raw_content: &str) -> Result<Value> {
        anyhow::bail!("no extraction service configured; supply structured_guess per record")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    observability::logging::init_logging();
    observability::metrics::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_toml_file(path)?,
        None => PipelineConfig::default(),
    };

    match cli.command {
        Commands::Run { source_id, records, trust_tier } => {
            let records = load_records(&records)?;
            info!(source_id, records = records.len(), "starting dry run");

            let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
            let mut source = Source {
                id: None,
                source_id: source_id.clone(),
                name: source_id.clone(),
                active: true,
                trust_tier: parse_trust_tier(&trust_tier)?,
                last_crawled_at: None,
                created_at: Utc::now(),
            };
            storage.upsert_source(&mut source).await?;

            let orchestrator = IngestOrchestrator::new(
                storage,
                Arc::new(NoExtractionService),
                config,
                TaxonomyConfig::default_vocabulary(),
            )?;
            let run = orchestrator.run(&source_id, records).await?;

            println!("crawl run for {}: {:?}", run.source_id, run.status);
            println!(
                "  found {} | new {} | updated {} | duplicate {} | rejected {}",
                run.counts.found,
                run.counts.new,
                run.counts.updated,
                run.counts.duplicate,
                run.counts.rejected
            );
            for sample in &run.error_samples {
                println!("  error sample: {}", sample);
            }
        }
        Commands::Check { records } => {
            let records = load_records(&records)?;
            let normalizer = ExtractionNormalizer::new(config.confidence_floor);
            let crawl_day = Utc::now().date_naive();

            let mut accepted = 0usize;
            let mut rejected = 0usize;
            for record in &records {
                let Some(guess) = &record.structured_guess else {
                    rejected += 1;
                    println!("rejected: record without structured guess");
                    continue;
                };
                match normalizer.normalize(record, guess, crawl_day) {
                    Ok(candidate) => {
                        accepted += 1;
                        for warning in &candidate.warnings {
                            println!("warning ({}): {}", candidate.title, warning);
                        }
                    }
                    Err(rejection) => {
                        rejected += 1;
                        println!("rejected ({}): {}", rejection.kind(), rejection);
                    }
                }
            }
            println!("{} accepted, {} rejected of {}", accepted, rejected, records.len());
        }
    }

    Ok(())
}

fn load_records(path: &PathBuf) -> Result<Vec<RawRecord>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading records file {}", path.display()))?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<RawRecord>(line)
                .with_context(|| format!("parsing record line: {}", line))
        })
        .collect()
}

fn parse_trust_tier(raw: &str) -> Result<TrustTier> {
    match raw.to_lowercase().as_str() {
        "unvetted" => Ok(TrustTier::Unvetted),
        "standard" => Ok(TrustTier::Standard),
        "established" => Ok(TrustTier::Established),
        "verified" => Ok(TrustTier::Verified),
        other => anyhow::bail!("unknown trust tier '{}'", other),
    }
}
