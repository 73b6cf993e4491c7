//! Core domain model for the job board aggregator.

pub mod dates;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "rjba-core";

/// One scraped job posting. `url` is the identifying key across all sources;
/// everything else is mutable on re-scrape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListing {
    pub title: String,
    pub company: String,
    pub location: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
    pub source: String,
    #[serde(default)]
    pub salary: Option<String>,
    #[serde(default)]
    pub job_type: Option<String>,
    #[serde(default)]
    pub experience_level: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
    /// Posted date exactly as the source printed it, if it printed one.
    #[serde(default)]
    pub posted_date_raw: Option<String>,
    /// Normalized instant, or `None` when no date could be derived.
    #[serde(default)]
    pub posted_date_canonical: Option<DateTime<Utc>>,
}

impl JobListing {
    /// A listing is only worth keeping when title, company and url all
    /// survive trimming.
    pub fn has_required_fields(&self) -> bool {
        !self.title.trim().is_empty()
            && !self.company.trim().is_empty()
            && !self.url.trim().is_empty()
    }
}

/// Derived counts over a listing batch. Recomputed on demand, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub total: usize,
    pub sources: BTreeMap<String, usize>,
    pub top_companies: BTreeMap<String, usize>,
    pub locations: BTreeMap<String, usize>,
}

impl AggregateStats {
    pub fn from_listings(listings: &[JobListing]) -> Self {
        let mut stats = Self {
            total: listings.len(),
            ..Self::default()
        };
        for listing in listings {
            *stats.sources.entry(listing.source.clone()).or_default() += 1;
            *stats
                .top_companies
                .entry(listing.company.clone())
                .or_default() += 1;
            *stats.locations.entry(listing.location.clone()).or_default() += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(title: &str, company: &str, url: &str, source: &str, location: &str) -> JobListing {
        JobListing {
            title: title.to_string(),
            company: company.to_string(),
            location: location.to_string(),
            description: String::new(),
            url: url.to_string(),
            source: source.to_string(),
            salary: None,
            job_type: None,
            experience_level: None,
            logo: None,
            posted_date_raw: None,
            posted_date_canonical: None,
        }
    }

    #[test]
    fn required_fields_reject_blank_after_trimming() {
        assert!(listing("Engineer", "Acme", "https://a.test/1", "A", "Remote").has_required_fields());
        assert!(!listing("  ", "Acme", "https://a.test/1", "A", "Remote").has_required_fields());
        assert!(!listing("Engineer", "", "https://a.test/1", "A", "Remote").has_required_fields());
        assert!(!listing("Engineer", "Acme", " \t", "A", "Remote").has_required_fields());
    }

    #[test]
    fn stats_are_invariant_under_permutation() {
        let mut batch = vec![
            listing("A", "Acme", "u1", "RemoteOK", "Remote"),
            listing("B", "Acme", "u2", "NoDesk", "Berlin"),
            listing("C", "Globex", "u3", "RemoteOK", "Remote"),
        ];
        let forward = AggregateStats::from_listings(&batch);
        batch.reverse();
        let backward = AggregateStats::from_listings(&batch);
        assert_eq!(forward, backward);
        assert_eq!(forward.total, 3);
        assert_eq!(forward.sources.get("RemoteOK"), Some(&2));
        assert_eq!(forward.top_companies.get("Acme"), Some(&2));
        assert_eq!(forward.locations.get("Remote"), Some(&2));
    }

    #[test]
    fn interchange_format_uses_camel_case_keys() {
        let mut l = listing("A", "Acme", "u1", "RemoteOK", "Remote");
        l.job_type = Some("Full-Time".to_string());
        l.posted_date_raw = Some("3 days ago".to_string());
        let json = serde_json::to_value(&l).unwrap();
        assert!(json.get("jobType").is_some());
        assert!(json.get("postedDateRaw").is_some());
        assert!(json.get("postedDateCanonical").is_some());
        let stats_json = serde_json::to_value(AggregateStats::from_listings(&[l])).unwrap();
        assert!(stats_json.get("topCompanies").is_some());
    }
}
