//! Source adapter contracts + selector-driven board implementations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Url;
use rjba_core::JobListing;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "rjba-adapters";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Configuration for the shared HTTP resource all adapters borrow.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
        }
    }
}

impl FetcherConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout: std::env::var("RJBA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            user_agent: std::env::var("RJBA_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }
}

/// The one HTTP client every adapter shares. Timeouts apply per request, so
/// a hung page load surfaces as a failed attempt rather than a stuck run.
#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
}

impl PageFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building http client")?;
        Ok(Self { client })
    }

    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.text().await?)
    }
}

/// Capability implemented once per job board. Implementations may fail
/// transiently (the orchestrator retries) or return an empty batch for
/// "nothing found".
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_listings(
        &self,
        query: &str,
        location: &str,
        pages: u32,
    ) -> Result<Vec<JobListing>, AdapterError>;
}

/// Immutable name → adapter mapping, built once at startup and passed to the
/// pipeline explicitly so tests can substitute fakes.
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: BTreeMap::new(),
        }
    }

    /// Every built-in board, wired to the shared fetcher.
    pub fn builtin(fetcher: Arc<PageFetcher>) -> Self {
        let mut registry = Self::new();
        for config in [
            boards::weworkremotely(),
            boards::remoteok(),
            boards::remotive(),
            boards::workingnomads(),
            boards::skipthedrive(),
            boards::jobspresso(),
            boards::nodesk(),
        ] {
            let key = config.key;
            registry.register(key, Arc::new(HtmlBoardAdapter::new(config, fetcher.clone())));
        }
        registry.register(
            "ycombinator",
            Arc::new(YCombinatorAdapter::new(fetcher.clone())),
        );
        registry
    }

    pub fn register(&mut self, key: impl Into<String>, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(key.into().to_lowercase(), adapter);
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn SourceAdapter>> {
        self.adapters.get(&key.trim().to_lowercase())
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a board hides the listing URL within a card.
#[derive(Debug, Clone, Copy)]
pub enum UrlRule {
    /// `href` of the first element matching the selector.
    Href(&'static str),
    /// `href` of the first anchor anywhere in the card.
    FirstAnchor,
    /// An attribute on the card element itself.
    CardAttr(&'static str),
}

/// One board's extraction recipe: a search-URL builder plus the CSS
/// selectors for each field. Boards differ only in this data.
#[derive(Debug, Clone)]
pub struct BoardConfig {
    pub key: &'static str,
    pub name: &'static str,
    pub base_url: &'static str,
    pub build_url: fn(&str, u32) -> String,
    pub card: &'static str,
    pub title: &'static str,
    pub company: &'static str,
    /// Some boards repeat the company selector for several values; this
    /// picks which occurrence is the company name.
    pub company_index: usize,
    pub location: Option<&'static str>,
    pub location_default: &'static str,
    pub url: UrlRule,
    pub description: Option<&'static str>,
    pub posted: Option<&'static str>,
    pub salary: Option<&'static str>,
    pub logo: Option<&'static str>,
    /// Category chips joined into a single job-type string.
    pub job_type_list: Option<&'static str>,
}

fn with_params(base: &str, params: &[(&str, &str)]) -> String {
    Url::parse_with_params(base, params.iter().copied())
        .map(String::from)
        .unwrap_or_else(|_| base.to_string())
}

fn query_slug(query: &str) -> String {
    query
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

pub mod boards {
    //! Per-board recipes. Selectors track each board's current listing
    //! markup; when a board redesigns, only its entry here changes.

    use super::{with_params, BoardConfig, UrlRule};

    pub fn weworkremotely() -> BoardConfig {
        BoardConfig {
            key: "weworkremotely",
            name: "We Work Remotely",
            base_url: "https://weworkremotely.com",
            build_url: |query, page| {
                with_params(
                    "https://weworkremotely.com/remote-jobs/search",
                    &[("term", query), ("page", &page.to_string())],
                )
            },
            card: "li.new-listing-container",
            title: "h4.new-listing__header__title",
            company: "p.new-listing__company-name",
            company_index: 0,
            location: Some("p.new-listing__company-headquarters"),
            location_default: "Remote",
            url: UrlRule::FirstAnchor,
            description: None,
            posted: Some("p.new-listing__header__icons__date"),
            salary: None,
            logo: None,
            job_type_list: Some("div.new-listing__categories p.new-listing__categories__category"),
        }
    }

    pub fn remoteok() -> BoardConfig {
        BoardConfig {
            key: "remoteok",
            name: "RemoteOK",
            base_url: "https://remoteok.com",
            build_url: |query, page| {
                format!(
                    "https://remoteok.com/remote-{}-jobs?page={}",
                    super::query_slug(query),
                    page
                )
            },
            card: "tr.job",
            title: "h2",
            company: ".companyLink h3",
            company_index: 0,
            location: Some(".location"),
            location_default: "Remote",
            url: UrlRule::CardAttr("data-href"),
            description: None,
            posted: Some("time"),
            salary: None,
            logo: None,
            job_type_list: None,
        }
    }

    pub fn remotive() -> BoardConfig {
        BoardConfig {
            key: "remotive",
            name: "Remotive",
            base_url: "https://remotive.com",
            build_url: |query, page| {
                with_params(
                    "https://remotive.com/remote-jobs",
                    &[("search", query), ("page", &page.to_string())],
                )
            },
            card: "li.tw-cursor-pointer",
            title: ".job-tile-title a .remotive-bold",
            company: ".job-tile-title a .remotive-bold",
            // Title, separator and company share one styling class; the
            // company is the third occurrence.
            company_index: 2,
            location: Some(".job-tile-location"),
            location_default: "Remote",
            url: UrlRule::Href(".job-tile-title a"),
            description: None,
            posted: None,
            salary: Some(".job-tile-salary"),
            logo: Some("img.tw-bg-white"),
            job_type_list: None,
        }
    }

    pub fn workingnomads() -> BoardConfig {
        BoardConfig {
            key: "workingnomads",
            name: "Working Nomads",
            base_url: "https://www.workingnomads.co",
            build_url: |query, page| {
                with_params(
                    "https://www.workingnomads.co/jobs",
                    &[("search", query), ("page", &page.to_string())],
                )
            },
            card: "div.job-desktop",
            title: "h4 a",
            company: ".company a",
            company_index: 0,
            location: Some(".boxes .box:first-child span"),
            location_default: "Remote",
            url: UrlRule::Href("h4 a"),
            description: None,
            posted: None,
            salary: None,
            logo: None,
            job_type_list: None,
        }
    }

    pub fn skipthedrive() -> BoardConfig {
        BoardConfig {
            key: "skipthedrive",
            name: "SkipTheDrive",
            base_url: "https://www.skipthedrive.com",
            build_url: |query, page| {
                with_params(
                    "https://www.skipthedrive.com/",
                    &[("s", query), ("paged", &page.to_string())],
                )
            },
            card: ".post-content",
            title: "h2.post-title.entry-title a",
            company: ".custom_fields_company_name_display_search_results",
            company_index: 0,
            location: None,
            location_default: "Remote",
            url: UrlRule::Href("h2.post-title.entry-title a"),
            description: Some("p"),
            posted: Some(".custom_fields_job_date_display_search_results"),
            salary: None,
            logo: None,
            job_type_list: None,
        }
    }

    pub fn jobspresso() -> BoardConfig {
        BoardConfig {
            key: "jobspresso",
            name: "Jobspresso",
            base_url: "https://jobspresso.co",
            build_url: |query, page| {
                with_params(
                    &format!("https://jobspresso.co/remote-jobs/page/{page}/"),
                    &[("search_keywords", query)],
                )
            },
            card: ".job_listing",
            title: ".job_listing-title",
            company: ".job_listing-company strong",
            company_index: 0,
            location: Some(".job_listing-location"),
            location_default: "Remote",
            url: UrlRule::Href("a.job_listing-clickbox"),
            description: None,
            posted: None,
            salary: None,
            logo: None,
            job_type_list: None,
        }
    }

    pub fn nodesk() -> BoardConfig {
        BoardConfig {
            key: "nodesk",
            name: "NoDesk",
            base_url: "https://nodesk.co",
            build_url: |query, page| {
                with_params(
                    "https://nodesk.co/remote-jobs/",
                    &[("search", query), ("page", &page.to_string())],
                )
            },
            card: "li.ais-Hits-item",
            title: "h2 a",
            company: "h3",
            company_index: 0,
            location: Some(".inline-flex h5"),
            location_default: "Remote",
            url: UrlRule::Href("h2 a"),
            description: None,
            posted: None,
            salary: None,
            logo: Some("img"),
            job_type_list: None,
        }
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

fn nth_text(card: ElementRef, selector: &str, n: usize) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(card
        .select(&sel)
        .nth(n)
        .and_then(|el| text_or_none(el.text().collect::<String>())))
}

fn first_text(card: ElementRef, selector: &str) -> Result<Option<String>, AdapterError> {
    nth_text(card, selector, 0)
}

fn all_texts(card: ElementRef, selector: &str) -> Result<Vec<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(card
        .select(&sel)
        .filter_map(|el| text_or_none(el.text().collect::<String>()))
        .collect())
}

fn first_attr(card: ElementRef, selector: &str, attr: &str) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(card
        .select(&sel)
        .next()
        .and_then(|el| el.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn resolve_url(base_url: &str, href: &str) -> String {
    if href.starts_with("http") {
        href.to_string()
    } else {
        format!("{base_url}{href}")
    }
}

/// Extract listings from one search-results page according to a board's
/// recipe. Cards missing title, company or url are dropped here, before
/// they ever reach the pipeline.
pub fn parse_board_page(config: &BoardConfig, html: &str) -> Result<Vec<JobListing>, AdapterError> {
    let document = Html::parse_document(html);
    let card_sel = parse_selector(config.card)?;
    let mut listings = Vec::new();

    for card in document.select(&card_sel) {
        let title = first_text(card, config.title)?;
        let company = nth_text(card, config.company, config.company_index)?;
        let href = match config.url {
            UrlRule::Href(selector) => first_attr(card, selector, "href")?
                .or(first_attr(card, "a", "href")?),
            UrlRule::FirstAnchor => first_attr(card, "a", "href")?,
            UrlRule::CardAttr(attr) => card.value().attr(attr).and_then(|s| text_or_none(s.to_string())),
        };
        let (Some(title), Some(company), Some(href)) = (title, company, href) else {
            continue;
        };

        let location = match config.location {
            Some(selector) => {
                let parts = all_texts(card, selector)?;
                if parts.is_empty() {
                    config.location_default.to_string()
                } else {
                    parts.join(", ")
                }
            }
            None => config.location_default.to_string(),
        };
        let description = match config.description {
            Some(selector) => first_text(card, selector)?.unwrap_or_default(),
            None => String::new(),
        };
        let posted_date_raw = match config.posted {
            Some(selector) => first_text(card, selector)?,
            None => None,
        };
        let salary = match config.salary {
            Some(selector) => first_text(card, selector)?,
            None => None,
        };
        let logo = match config.logo {
            Some(selector) => first_attr(card, selector, "src")?,
            None => None,
        };
        let job_type = match config.job_type_list {
            Some(selector) => {
                let categories = all_texts(card, selector)?;
                if categories.is_empty() {
                    None
                } else {
                    Some(categories.join(", "))
                }
            }
            None => None,
        };

        listings.push(JobListing {
            title,
            company,
            location,
            description,
            url: resolve_url(config.base_url, &href),
            source: config.name.to_string(),
            salary,
            job_type,
            experience_level: None,
            logo,
            posted_date_raw,
            posted_date_canonical: None,
        });
    }

    Ok(listings)
}

/// Selector-driven adapter covering every plain-HTML board.
pub struct HtmlBoardAdapter {
    config: BoardConfig,
    fetcher: Arc<PageFetcher>,
}

impl HtmlBoardAdapter {
    pub fn new(config: BoardConfig, fetcher: Arc<PageFetcher>) -> Self {
        Self { config, fetcher }
    }
}

#[async_trait]
impl SourceAdapter for HtmlBoardAdapter {
    fn name(&self) -> &'static str {
        self.config.name
    }

    async fn fetch_listings(
        &self,
        query: &str,
        _location: &str,
        pages: u32,
    ) -> Result<Vec<JobListing>, AdapterError> {
        let mut listings = Vec::new();
        for page in 1..=pages.max(1) {
            let url = (self.config.build_url)(query, page);
            debug!(source = self.config.key, %url, page, "fetching listing page");
            let html = self.fetcher.get_text(&url).await?;
            listings.extend(parse_board_page(&self.config, &html)?);
        }
        Ok(listings)
    }
}

const YC_BASE_URL: &str = "https://www.ycombinator.com";
const YC_EMBED_SELECTOR: &str = r#"[id^="WaasLandingPage-react-component-"]"#;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct YcJobPosting {
    title: Option<String>,
    company_name: Option<String>,
    location: Option<String>,
    company_one_liner: Option<String>,
    url: Option<String>,
    created_at: Option<String>,
    salary_range: Option<String>,
    min_experience: Option<String>,
    company_logo_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct YcPageProps {
    #[serde(rename = "jobPostings", default)]
    job_postings: Vec<YcJobPosting>,
}

#[derive(Debug, Deserialize, Default)]
struct YcPageData {
    #[serde(default)]
    props: YcPageProps,
}

/// Y Combinator renders its board as JSON embedded in a `data-page`
/// attribute instead of crawlable cards, so it gets its own adapter.
pub fn parse_embedded_jobs(html: &str) -> Result<Vec<JobListing>, AdapterError> {
    let document = Html::parse_document(html);
    let sel = parse_selector(YC_EMBED_SELECTOR)?;
    let Some(payload) = document
        .select(&sel)
        .next()
        .and_then(|el| el.value().attr("data-page"))
    else {
        return Err(AdapterError::Message(
            "embedded job data attribute not found".to_string(),
        ));
    };
    let page: YcPageData = serde_json::from_str(payload)
        .map_err(|e| AdapterError::Message(format!("invalid embedded job JSON: {e}")))?;

    let listings = page
        .props
        .job_postings
        .into_iter()
        .filter_map(|posting| {
            let title = posting.title.and_then(text_or_none)?;
            let company = posting.company_name.and_then(text_or_none)?;
            let url = posting.url.and_then(text_or_none)?;
            Some(JobListing {
                title,
                company,
                location: posting
                    .location
                    .and_then(text_or_none)
                    .unwrap_or_else(|| "Remote".to_string()),
                description: posting.company_one_liner.unwrap_or_default(),
                url: resolve_url(YC_BASE_URL, &url),
                source: "Y Combinator Jobs".to_string(),
                salary: posting.salary_range.and_then(text_or_none),
                job_type: None,
                experience_level: posting.min_experience.and_then(text_or_none),
                logo: posting.company_logo_url.and_then(text_or_none),
                posted_date_raw: posting.created_at.and_then(text_or_none),
                posted_date_canonical: None,
            })
        })
        .collect();
    Ok(listings)
}

pub struct YCombinatorAdapter {
    fetcher: Arc<PageFetcher>,
}

impl YCombinatorAdapter {
    pub fn new(fetcher: Arc<PageFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl SourceAdapter for YCombinatorAdapter {
    fn name(&self) -> &'static str {
        "Y Combinator Jobs"
    }

    async fn fetch_listings(
        &self,
        query: &str,
        _location: &str,
        pages: u32,
    ) -> Result<Vec<JobListing>, AdapterError> {
        let mut listings = Vec::new();
        for page in 1..=pages.max(1) {
            let url = with_params(
                "https://www.ycombinator.com/jobs",
                &[("query", query), ("page", &page.to_string())],
            );
            debug!(source = "ycombinator", %url, page, "fetching listing page");
            let html = self.fetcher.get_text(&url).await?;
            listings.extend(parse_embedded_jobs(&html)?);
        }
        Ok(listings)
    }
}
