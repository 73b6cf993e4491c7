//! URL-keyed listing persistence: upsert-by-key semantics over a pluggable
//! row store, plus the bulk-import path for saved batch files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use rjba_core::JobListing;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rjba-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing listing {url}: {source}")]
    Serialize {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("parsing stored row {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Upsert-capable row store keyed by listing URL. Calling `upsert` twice
/// with the same key must leave exactly one row behind.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn upsert(&self, listing: &JobListing) -> Result<UpsertOutcome, StoreError>;
    async fn get(&self, url: &str) -> Result<Option<JobListing>, StoreError>;
    async fn list_all(&self) -> Result<Vec<JobListing>, StoreError>;
}

/// Trim every string field and collapse empty optionals to explicit absence.
/// The canonical posted date passes through untouched — an underivable date
/// stays absent rather than being backfilled with the current time.
pub fn clean_listing(listing: &JobListing) -> JobListing {
    fn opt(value: &Option<String>) -> Option<String> {
        value
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
    }

    JobListing {
        title: listing.title.trim().to_string(),
        company: listing.company.trim().to_string(),
        location: listing.location.trim().to_string(),
        description: listing.description.trim().to_string(),
        url: listing.url.trim().to_string(),
        source: listing.source.trim().to_string(),
        salary: opt(&listing.salary),
        job_type: opt(&listing.job_type),
        experience_level: opt(&listing.experience_level),
        logo: opt(&listing.logo),
        posted_date_raw: opt(&listing.posted_date_raw),
        posted_date_canonical: listing.posted_date_canonical,
    }
}

/// Per-batch tally of what `upsert_all` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub skipped_invalid: usize,
    pub failed: usize,
}

/// Best-effort batch upsert. Listings without required fields are skipped
/// whole; a failure on one record is logged and tallied without blocking
/// the rest of the batch.
pub async fn upsert_all(store: &dyn ListingStore, listings: &[JobListing]) -> UpsertReport {
    let mut report = UpsertReport::default();
    for listing in listings {
        if !listing.has_required_fields() {
            report.skipped_invalid += 1;
            continue;
        }
        let cleaned = clean_listing(listing);
        match store.upsert(&cleaned).await {
            Ok(UpsertOutcome::Inserted) => report.inserted += 1,
            Ok(UpsertOutcome::Updated) => report.updated += 1,
            Err(err) => {
                warn!(url = %cleaned.url, error = %err, "upsert failed; continuing with batch");
                report.failed += 1;
            }
        }
    }
    report
}

/// Read a saved batch file (a JSON array of listings) and upsert everything
/// in it.
pub async fn import_batch_file(
    store: &dyn ListingStore,
    path: impl AsRef<Path>,
) -> anyhow::Result<UpsertReport> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let listings: Vec<JobListing> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(upsert_all(store, &listings).await)
}

/// File-backed store: one JSON row per listing at a hash-addressed path, so
/// the same URL always lands on the same file and re-scrapes overwrite
/// instead of duplicating. Rows are written to a temp file and renamed into
/// place atomically.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stable row key: first 16 hex chars of sha256 over the trimmed URL.
    pub fn key_for(url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.trim().as_bytes());
        hex::encode(&hasher.finalize()[..8])
    }

    fn row_path(&self, url: &str) -> PathBuf {
        self.root.join(format!("{}.json", Self::key_for(url)))
    }
}

#[async_trait]
impl ListingStore for FileStore {
    async fn upsert(&self, listing: &JobListing) -> Result<UpsertOutcome, StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_err(&self.root, e))?;

        let path = self.row_path(&listing.url);
        let existed = fs::try_exists(&path).await.map_err(|e| io_err(&path, e))?;

        let bytes = serde_json::to_vec_pretty(listing).map_err(|e| StoreError::Serialize {
            url: listing.url.clone(),
            source: e,
        })?;

        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| io_err(&temp_path, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| io_err(&temp_path, e))?;
        file.flush().await.map_err(|e| io_err(&temp_path, e))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(&path, err));
        }

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    async fn get(&self, url: &str) -> Result<Option<JobListing>, StoreError> {
        let path = self.row_path(url);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_err(&path, err)),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| StoreError::Parse { path, source: e })
    }

    async fn list_all(&self) -> Result<Vec<JobListing>, StoreError> {
        let mut rows = Vec::new();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(rows),
            Err(err) => return Err(io_err(&self.root, err)),
        };
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_err(&self.root, e))? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            let text = fs::read_to_string(&path)
                .await
                .map_err(|e| io_err(&path, e))?;
            let listing =
                serde_json::from_str(&text).map_err(|e| StoreError::Parse { path, source: e })?;
            rows.push(listing);
        }
        Ok(rows)
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, JobListing>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn upsert(&self, listing: &JobListing) -> Result<UpsertOutcome, StoreError> {
        let mut rows = self.rows.lock().await;
        let outcome = if rows.contains_key(listing.url.trim()) {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        };
        rows.insert(listing.url.trim().to_string(), listing.clone());
        Ok(outcome)
    }

    async fn get(&self, url: &str) -> Result<Option<JobListing>, StoreError> {
        Ok(self.rows.lock().await.get(url.trim()).cloned())
    }

    async fn list_all(&self) -> Result<Vec<JobListing>, StoreError> {
        Ok(self.rows.lock().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn listing(title: &str, company: &str, url: &str) -> JobListing {
        JobListing {
            title: title.to_string(),
            company: company.to_string(),
            location: "Remote".to_string(),
            description: String::new(),
            url: url.to_string(),
            source: "TestBoard".to_string(),
            salary: None,
            job_type: None,
            experience_level: None,
            logo: None,
            posted_date_raw: None,
            posted_date_canonical: None,
        }
    }

    #[test]
    fn row_keys_are_stable_and_url_scoped() {
        let a = FileStore::key_for("https://a.test/jobs/1");
        let b = FileStore::key_for("https://a.test/jobs/1  ");
        let c = FileStore::key_for("https://a.test/jobs/2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn cleaning_trims_and_drops_empty_optionals() {
        let mut raw = listing("  Engineer  ", " Acme ", " https://a.test/1 ");
        raw.salary = Some("   ".to_string());
        raw.job_type = Some(" Full-Time ".to_string());
        let cleaned = clean_listing(&raw);
        assert_eq!(cleaned.title, "Engineer");
        assert_eq!(cleaned.company, "Acme");
        assert_eq!(cleaned.url, "https://a.test/1");
        assert_eq!(cleaned.salary, None);
        assert_eq!(cleaned.job_type.as_deref(), Some("Full-Time"));
    }

    #[tokio::test]
    async fn re_upserting_the_same_url_keeps_one_row_with_latest_values() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());

        let first = listing("Engineer", "Acme", "https://a.test/jobs/1");
        let mut second = first.clone();
        second.title = "Senior Engineer".to_string();
        second.salary = Some("$150k".to_string());

        assert_eq!(store.upsert(&first).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&second).await.unwrap(), UpsertOutcome::Updated);

        let rows = store.list_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Senior Engineer");
        assert_eq!(rows[0].salary.as_deref(), Some("$150k"));
    }

    #[tokio::test]
    async fn batch_upsert_skips_invalid_and_keeps_going() {
        let store = MemoryStore::new();
        let batch = vec![
            listing("Engineer", "Acme", "https://a.test/1"),
            listing("", "Acme", "https://a.test/2"),
            listing("Analyst", "", "https://a.test/3"),
            listing("Designer", "Globex", ""),
            listing("Engineer", "Acme", "https://a.test/1"),
        ];
        let report = upsert_all(&store, &batch).await;
        assert_eq!(report.inserted, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.skipped_invalid, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn absent_canonical_date_is_stored_as_absent() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        let mut l = listing("Engineer", "Acme", "https://a.test/1");
        l.posted_date_raw = Some("whenever".to_string());
        l.posted_date_canonical = None;
        store.upsert(&clean_listing(&l)).await.unwrap();
        let row = store.get("https://a.test/1").await.unwrap().unwrap();
        assert_eq!(row.posted_date_canonical, None);
        assert_eq!(row.posted_date_raw.as_deref(), Some("whenever"));
    }

    #[tokio::test]
    async fn import_reads_a_saved_batch_array() {
        let dir = tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().join("rows"));

        let mut a = listing("Engineer", "Acme", "https://a.test/1");
        a.posted_date_canonical = Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).single();
        let b = listing("Analyst", "Globex", "https://b.test/2");
        let batch_path = dir.path().join("batch.json");
        std::fs::write(
            &batch_path,
            serde_json::to_vec_pretty(&vec![a.clone(), b]).unwrap(),
        )
        .unwrap();

        let report = import_batch_file(&store, &batch_path).await.unwrap();
        assert_eq!(report.inserted, 2);
        let stored = store.get("https://a.test/1").await.unwrap().unwrap();
        assert_eq!(stored.posted_date_canonical, a.posted_date_canonical);
    }
}
