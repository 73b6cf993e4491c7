//! Aggregation pipeline: drives source adapters under the retry policy,
//! merges their output, normalizes posted dates, and persists the batch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rjba_adapters::{AdapterError, AdapterRegistry, SourceAdapter};
use rjba_core::{dates, AggregateStats, JobListing};
use rjba_storage::{upsert_all, ListingStore, UpsertReport};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rjba-pipeline";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Attempts per source before its failure is final.
    pub max_retries: usize,
    /// Base for the linear retry backoff.
    pub retry_base_delay: Duration,
    /// Unconditional pause after each source, successful or not.
    pub source_delay: Duration,
    /// Where batch files and stats reports land.
    pub output_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(2000),
            source_delay: Duration::from_millis(2000),
            output_dir: PathBuf::from("./job_data"),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let millis = |name: &str, fallback: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };
        Self {
            max_retries: std::env::var("RJBA_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            retry_base_delay: millis("RJBA_RETRY_BASE_MS", defaults.retry_base_delay),
            source_delay: millis("RJBA_SOURCE_DELAY_MS", defaults.source_delay),
            output_dir: std::env::var("RJBA_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
        }
    }
}

/// Retry delay grows linearly with the attempt number: `base × attempt`.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    pub base_delay: Duration,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(2000),
        }
    }
}

impl LinearBackoff {
    /// Delay after the given attempt, 1-based.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        self.base_delay.saturating_mul(attempt as u32)
    }
}

/// Runs one adapter under the bounded-retry policy. Each attempt starts the
/// adapter fresh; nothing is carried over between attempts.
#[derive(Debug, Clone)]
pub struct RetryingOrchestrator {
    max_retries: usize,
    backoff: LinearBackoff,
}

impl RetryingOrchestrator {
    pub fn new(max_retries: usize, backoff: LinearBackoff) -> Self {
        Self {
            max_retries: max_retries.max(1),
            backoff,
        }
    }

    pub async fn run(
        &self,
        adapter: &dyn SourceAdapter,
        query: &str,
        location: &str,
        pages: u32,
    ) -> Result<Vec<JobListing>, AdapterError> {
        let mut attempt = 1;
        loop {
            match adapter.fetch_listings(query, location, pages).await {
                Ok(listings) => return Ok(listings),
                Err(err) if attempt < self.max_retries => {
                    warn!(
                        source = adapter.name(),
                        attempt,
                        error = %err,
                        "adapter attempt failed; retrying"
                    );
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Rewrite each listing's canonical posted date from its raw text, using the
/// batch capture instant as the reference. Underivable dates stay `None` —
/// storage records absence, never a fabricated "now".
pub fn normalize_posted_dates(listings: &mut [JobListing], captured_at: DateTime<Utc>) {
    for listing in listings {
        listing.posted_date_canonical =
            dates::derive_absolute(listing.posted_date_raw.as_deref(), captured_at);
    }
}

pub struct AggregationPipeline {
    registry: AdapterRegistry,
    orchestrator: RetryingOrchestrator,
    config: PipelineConfig,
}

impl AggregationPipeline {
    pub fn new(registry: AdapterRegistry, config: PipelineConfig) -> Self {
        let orchestrator = RetryingOrchestrator::new(
            config.max_retries,
            LinearBackoff {
                base_delay: config.retry_base_delay,
            },
        );
        Self {
            registry,
            orchestrator,
            config,
        }
    }

    pub fn available_sources(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Scrape the named sources in order and return the merged, normalized
    /// batch. Unknown sources and sources that fail all retries are logged
    /// and skipped; this never aborts the run.
    pub async fn scrape(
        &self,
        sources: &[String],
        query: &str,
        location: &str,
        pages: u32,
    ) -> Vec<JobListing> {
        self.scrape_with_outcomes(sources, query, location, pages)
            .await
            .0
    }

    /// Like [`scrape`](Self::scrape), but also returns what happened to each
    /// requested source — including the ones that produced nothing.
    pub async fn scrape_with_outcomes(
        &self,
        sources: &[String],
        query: &str,
        location: &str,
        pages: u32,
    ) -> (Vec<JobListing>, Vec<SourceOutcome>) {
        let mut merged = Vec::new();
        let mut outcomes = Vec::with_capacity(sources.len());
        for source in sources {
            let Some(adapter) = self.registry.get(source) else {
                warn!(source = %source, "no adapter registered for source; skipping");
                outcomes.push(SourceOutcome {
                    source: source.clone(),
                    listings: 0,
                    status: SourceStatus::Unknown,
                });
                continue;
            };
            match self
                .orchestrator
                .run(adapter.as_ref(), query, location, pages)
                .await
            {
                Ok(listings) => {
                    info!(source = adapter.name(), count = listings.len(), "source scraped");
                    outcomes.push(SourceOutcome {
                        source: source.clone(),
                        listings: listings.len(),
                        status: SourceStatus::Ok,
                    });
                    merged.extend(listings);
                }
                Err(err) => {
                    warn!(
                        source = adapter.name(),
                        error = %err,
                        "source failed after retries; continuing without it"
                    );
                    outcomes.push(SourceOutcome {
                        source: source.clone(),
                        listings: 0,
                        status: SourceStatus::Failed,
                    });
                }
            }
            // Politeness pause between sources, regardless of outcome.
            tokio::time::sleep(self.config.source_delay).await;
        }

        normalize_posted_dates(&mut merged, Utc::now());
        (merged, outcomes)
    }

    pub fn stats(&self, listings: &[JobListing]) -> AggregateStats {
        AggregateStats::from_listings(listings)
    }

    /// Write the batch as a JSON array under the output directory. The
    /// filename defaults to a timestamped `jobs_*.json`.
    pub async fn save_batch(
        &self,
        listings: &[JobListing],
        filename: Option<&str>,
    ) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let filename = filename
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("jobs_{stamp}.json"));
        let path = self.config.output_dir.join(filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(listings).context("serializing batch")?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(count = listings.len(), path = %path.display(), "batch saved");
        Ok(path)
    }

    /// Write the derived statistics next to the batch file.
    pub async fn save_stats(&self, stats: &AggregateStats, filename: &str) -> Result<PathBuf> {
        let path = self.config.output_dir.join(filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(stats).context("serializing stats")?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

/// What happened to one requested source during a run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source: String,
    pub listings: usize,
    pub status: SourceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Ok,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub query: String,
    pub location: String,
    pub listings: usize,
    pub batch_file: String,
    pub source_outcomes: Vec<SourceOutcome>,
    pub stats: AggregateStats,
    pub upserts: UpsertReport,
}

/// One full run: scrape, save the batch file, upsert into the store, and
/// report per-source and total counts. Always completes unless the batch
/// file itself cannot be written.
pub async fn run_once(
    pipeline: &AggregationPipeline,
    store: &dyn ListingStore,
    sources: &[String],
    query: &str,
    location: &str,
    pages: u32,
) -> Result<RunSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(%run_id, query, location, sources = sources.len(), "starting scrape run");

    let (listings, source_outcomes) = pipeline
        .scrape_with_outcomes(sources, query, location, pages)
        .await;
    let stats = pipeline.stats(&listings);
    let batch_file = pipeline.save_batch(&listings, None).await?;
    let stats_file = batch_file
        .file_stem()
        .map(|stem| format!("{}_stats.json", stem.to_string_lossy()))
        .unwrap_or_else(|| "stats.json".to_string());
    pipeline.save_stats(&stats, &stats_file).await?;
    let upserts = upsert_all(store, &listings).await;

    let finished_at = Utc::now();
    info!(
        %run_id,
        total = stats.total,
        inserted = upserts.inserted,
        updated = upserts.updated,
        skipped = upserts.skipped_invalid,
        "scrape run finished"
    );

    Ok(RunSummary {
        run_id,
        started_at,
        finished_at,
        query: query.to_string(),
        location: location.to_string(),
        listings: listings.len(),
        batch_file: batch_file.display().to_string(),
        source_outcomes,
        stats,
        upserts,
    })
}

/// Build a scheduler that re-runs a full scrape of every registered source
/// on the given cron expression.
pub async fn schedule_recurring(
    pipeline: Arc<AggregationPipeline>,
    store: Arc<dyn ListingStore>,
    cron_expr: &str,
    query: String,
    location: String,
    pages: u32,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron_expr, move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        let store = store.clone();
        let query = query.clone();
        let location = location.clone();
        Box::pin(async move {
            let sources = pipeline.available_sources();
            match run_once(&pipeline, store.as_ref(), &sources, &query, &location, pages).await {
                Ok(summary) => info!(run_id = %summary.run_id, total = summary.stats.total, "scheduled scrape finished"),
                Err(err) => warn!(error = %err, "scheduled scrape failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron_expr}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rjba_storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mk_listing(title: &str, url: &str, source: &str, raw_date: Option<&str>) -> JobListing {
        JobListing {
            title: title.to_string(),
            company: "Acme".to_string(),
            location: "Remote".to_string(),
            description: String::new(),
            url: url.to_string(),
            source: source.to_string(),
            salary: None,
            job_type: None,
            experience_level: None,
            logo: None,
            posted_date_raw: raw_date.map(ToString::to_string),
            posted_date_canonical: None,
        }
    }

    /// Fails the first `fail_times` calls, then returns its payload.
    struct FlakyAdapter {
        name: &'static str,
        fail_times: usize,
        calls: AtomicUsize,
        payload: Vec<JobListing>,
    }

    impl FlakyAdapter {
        fn new(name: &'static str, fail_times: usize, payload: Vec<JobListing>) -> Self {
            Self {
                name,
                fail_times,
                calls: AtomicUsize::new(0),
                payload,
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for FlakyAdapter {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch_listings(
            &self,
            _query: &str,
            _location: &str,
            _pages: u32,
        ) -> Result<Vec<JobListing>, AdapterError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Err(AdapterError::Message(format!(
                    "simulated failure {}",
                    call + 1
                )))
            } else {
                Ok(self.payload.clone())
            }
        }
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            output_dir: PathBuf::from("./target/test-output"),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn backoff_grows_linearly() {
        let backoff = LinearBackoff::default();
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(6000));
    }

    #[tokio::test(start_paused = true)]
    async fn orchestrator_succeeds_on_third_attempt_after_linear_backoff() {
        let adapter = FlakyAdapter::new(
            "Flaky",
            2,
            vec![mk_listing("Engineer", "https://a.test/1", "Flaky", None)],
        );
        let orchestrator = RetryingOrchestrator::new(3, LinearBackoff::default());

        let before = tokio::time::Instant::now();
        let listings = orchestrator.run(&adapter, "dev", "", 1).await.unwrap();
        assert_eq!(listings.len(), 1);
        // 2000 ms after the first failure, 4000 ms after the second.
        assert_eq!(before.elapsed(), Duration::from_millis(6000));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn orchestrator_propagates_the_final_failure() {
        let adapter = FlakyAdapter::new("Broken", usize::MAX, Vec::new());
        let orchestrator = RetryingOrchestrator::new(3, LinearBackoff::default());
        let result = orchestrator.run(&adapter, "dev", "", 1).await;
        assert!(result.is_err());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_source_does_not_poison_the_batch() {
        let mut registry = AdapterRegistry::new();
        registry.register(
            "broken",
            Arc::new(FlakyAdapter::new("Broken", usize::MAX, Vec::new())),
        );
        let payload: Vec<JobListing> = (0..5)
            .map(|i| {
                mk_listing(
                    &format!("Role {i}"),
                    &format!("https://b.test/{i}"),
                    "Steady",
                    None,
                )
            })
            .collect();
        registry.register("steady", Arc::new(FlakyAdapter::new("Steady", 0, payload)));

        let pipeline = AggregationPipeline::new(registry, test_config());
        let sources = vec![
            "broken".to_string(),
            "steady".to_string(),
            "nosuchboard".to_string(),
        ];
        let (listings, outcomes) = pipeline.scrape_with_outcomes(&sources, "dev", "", 1).await;
        assert_eq!(listings.len(), 5);
        assert!(listings.iter().all(|l| l.source == "Steady"));

        // Every requested source is accounted for, zero results included.
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].status, SourceStatus::Failed);
        assert_eq!(outcomes[0].listings, 0);
        assert_eq!(outcomes[1].status, SourceStatus::Ok);
        assert_eq!(outcomes[1].listings, 5);
        assert_eq!(outcomes[2].status, SourceStatus::Unknown);
    }

    #[test]
    fn normalization_sets_canonical_or_leaves_absent() {
        let captured_at = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).single().unwrap();
        let mut batch = vec![
            mk_listing("A", "u1", "S", Some("3 days ago")),
            mk_listing("B", "u2", "S", None),
            mk_listing("C", "u3", "S", Some("whenever the mood struck")),
        ];
        normalize_posted_dates(&mut batch, captured_at);
        assert_eq!(
            batch[0].posted_date_canonical,
            Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).single()
        );
        assert_eq!(batch[1].posted_date_canonical, None);
        assert_eq!(batch[2].posted_date_canonical, None);
    }

    #[tokio::test(start_paused = true)]
    async fn run_once_saves_batch_and_upserts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut registry = AdapterRegistry::new();
        registry.register(
            "steady",
            Arc::new(FlakyAdapter::new(
                "Steady",
                0,
                vec![
                    mk_listing("Engineer", "https://b.test/1", "Steady", Some("yesterday")),
                    mk_listing("", "https://b.test/2", "Steady", None),
                ],
            )),
        );
        let config = PipelineConfig {
            output_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let pipeline = AggregationPipeline::new(registry, config);
        let store = MemoryStore::new();

        let summary = run_once(&pipeline, &store, &["steady".to_string()], "dev", "", 1)
            .await
            .unwrap();

        assert_eq!(summary.listings, 2);
        assert_eq!(summary.stats.total, 2);
        assert_eq!(summary.upserts.inserted, 1);
        assert_eq!(summary.upserts.skipped_invalid, 1);

        let saved = std::fs::read_to_string(&summary.batch_file).unwrap();
        let parsed: Vec<JobListing> = serde_json::from_str(&saved).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed[0].posted_date_canonical.is_some());

        let stored = store.get("https://b.test/1").await.unwrap().unwrap();
        assert!(stored.posted_date_canonical.is_some());
    }
}
