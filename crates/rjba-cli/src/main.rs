use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rjba_adapters::{AdapterRegistry, FetcherConfig, PageFetcher};
use rjba_core::{AggregateStats, JobListing};
use rjba_pipeline::{run_once, schedule_recurring, AggregationPipeline, PipelineConfig, RunSummary};
use rjba_storage::{import_batch_file, FileStore, ListingStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rjba")]
#[command(about = "Remote job board aggregator")]
struct Cli {
    /// Directory holding the upsert store's row files.
    #[arg(long, default_value = "./job_store")]
    store_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape selected sources once and upsert the results.
    Scrape {
        query: String,
        #[arg(default_value = "")]
        location: String,
        #[arg(long, default_value_t = 1)]
        pages: u32,
        /// Source keys to scrape; repeat the flag for several. Defaults to
        /// every registered source.
        #[arg(long = "source", value_name = "NAME")]
        sources: Vec<String>,
    },
    /// Scrape every registered source once.
    All {
        query: String,
        #[arg(default_value = "")]
        location: String,
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
    /// Run a recurring scrape of every source on a cron expression.
    Schedule {
        query: String,
        #[arg(default_value = "")]
        location: String,
        #[arg(long, default_value_t = 1)]
        pages: u32,
        /// Six-field cron expression; default fires hourly.
        #[arg(long, default_value = "0 0 * * * *")]
        cron: String,
    },
    /// Bulk-import a previously saved batch file into the store.
    Import { path: PathBuf },
    /// Print aggregate statistics for a saved batch file.
    Stats { path: PathBuf },
    /// List the registered source keys.
    Sources,
}

fn print_summary(summary: &RunSummary) -> Result<()> {
    println!(
        "run {} finished: {} listings from {} requested sources -> {}",
        summary.run_id,
        summary.listings,
        summary.source_outcomes.len(),
        summary.batch_file
    );
    for outcome in &summary.source_outcomes {
        println!(
            "  {:<20} {:>5} listings ({:?})",
            outcome.source, outcome.listings, outcome.status
        );
    }
    println!(
        "upserts: {} inserted, {} updated, {} skipped, {} failed",
        summary.upserts.inserted,
        summary.upserts.updated,
        summary.upserts.skipped_invalid,
        summary.upserts.failed
    );
    println!("{}", serde_json::to_string_pretty(&summary.stats)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // The shared fetcher failing to build is the one fatal startup error;
    // everything after this degrades per source instead of aborting.
    let fetcher = Arc::new(
        PageFetcher::new(FetcherConfig::from_env()).context("starting shared page fetcher")?,
    );
    let registry = AdapterRegistry::builtin(fetcher);
    let pipeline = AggregationPipeline::new(registry, PipelineConfig::from_env());
    let store = FileStore::new(&cli.store_dir);

    match cli.command {
        Commands::Scrape {
            query,
            location,
            pages,
            sources,
        } => {
            let sources = if sources.is_empty() {
                pipeline.available_sources()
            } else {
                sources
            };
            let summary = run_once(&pipeline, &store, &sources, &query, &location, pages).await?;
            print_summary(&summary)?;
        }
        Commands::All {
            query,
            location,
            pages,
        } => {
            let sources = pipeline.available_sources();
            let summary = run_once(&pipeline, &store, &sources, &query, &location, pages).await?;
            print_summary(&summary)?;
        }
        Commands::Schedule {
            query,
            location,
            pages,
            cron,
        } => {
            let pipeline = Arc::new(pipeline);
            let store: Arc<dyn ListingStore> = Arc::new(store);
            let scheduler =
                schedule_recurring(pipeline, store, &cron, query, location, pages).await?;
            scheduler.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
        Commands::Import { path } => {
            let report = import_batch_file(&store, &path).await?;
            println!(
                "imported {}: {} inserted, {} updated, {} skipped, {} failed",
                path.display(),
                report.inserted,
                report.updated,
                report.skipped_invalid,
                report.failed
            );
        }
        Commands::Stats { path } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let listings: Vec<JobListing> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            let stats = AggregateStats::from_listings(&listings);
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Sources => {
            for name in pipeline.available_sources() {
                println!("{name}");
            }
        }
    }

    Ok(())
}
