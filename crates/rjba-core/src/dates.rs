//! Posted-date normalization.
//!
//! Job boards print posted dates in wildly inconsistent shapes: absolute
//! timestamps, `3d`, `6 days ago`, `about 2 months`, `Posted 5 days ago`.
//! This module converts them both ways — to an absolute instant for storage
//! and sorting, and to a small canonical phrase set for display. Every
//! function is pure: the reference instant is always an argument, never the
//! clock.

use chrono::{DateTime, Duration, Months, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

static AGO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\s*(second|minute|hour|day|week|month|year)s?\s*ago").unwrap()
});

// Bare unit letter only; `2 months` must not match via the `m` of `months`.
static SHORTHAND_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s*([dmy])\b").unwrap());

static HEDGED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:about|over|almost)?\s*(\d+)\s*(second|minute|hour|day|week|month|year)s?")
        .unwrap()
});

static REL_SHORT_DAYS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)d$").unwrap());
static REL_DAYS_AGO: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)\s+days?\s+ago$").unwrap());
static REL_MONTHS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:about|over|almost)?\s*(\d+)\s+months?(?:\s+ago)?$").unwrap()
});
static REL_YEARS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:about|over|almost)?\s*(\d+)\s+years?(?:\s+ago)?$").unwrap()
});
static REL_POSTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^posted\s+(\d+)\s+(hours?|days?|weeks?|months?|years?)\s+ago$").unwrap()
});
static REL_DAYS_PLUS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)\+\s+days?\s+ago$").unwrap());

/// Parse a well-formed absolute date/time string. Accepts RFC 3339,
/// RFC 2822 and plain `%Y-%m-%d` dates (midnight UTC).
pub fn parse_absolute(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

fn subtract(reference: DateTime<Utc>, value: u32, unit: &str) -> DateTime<Utc> {
    match unit {
        "second" => reference - Duration::seconds(i64::from(value)),
        "minute" => reference - Duration::minutes(i64::from(value)),
        "hour" => reference - Duration::hours(i64::from(value)),
        "day" => reference - Duration::days(i64::from(value)),
        "week" => reference - Duration::days(i64::from(value) * 7),
        "month" => reference
            .checked_sub_months(Months::new(value))
            .unwrap_or(reference),
        "year" => reference
            .checked_sub_months(Months::new(value.saturating_mul(12)))
            .unwrap_or(reference),
        _ => reference,
    }
}

/// Derive an absolute instant from free text, or `None` when the input is
/// empty or matches no rule. Rule precedence is fixed: absolute parse, then
/// `new`/`today`/`yesterday`, then `<n> <unit> ago`, then the `3d`/`6m`/`2y`
/// shorthand, then hedged phrases like `about 2 months`. First match wins.
pub fn derive_absolute(raw: Option<&str>, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(dt) = parse_absolute(raw) {
        return Some(dt);
    }

    let lower = raw.to_lowercase();
    if lower == "new" || lower == "today" {
        return Some(reference);
    }
    if lower == "yesterday" {
        return Some(reference - Duration::days(1));
    }
    if let Some(c) = AGO_RE.captures(&lower) {
        let value: u32 = c[1].parse().ok()?;
        return Some(subtract(reference, value, &c[2]));
    }
    if let Some(c) = SHORTHAND_RE.captures(&lower) {
        let value: u32 = c[1].parse().ok()?;
        let unit = match &c[2] {
            "d" => "day",
            "m" => "month",
            _ => "year",
        };
        return Some(subtract(reference, value, unit));
    }
    if let Some(c) = HEDGED_RE.captures(&lower) {
        // Hedge words (`about`, `over`, `almost`) are recognized but do not
        // change the arithmetic.
        let value: u32 = c[1].parse().ok()?;
        return Some(subtract(reference, value, &c[2]));
    }
    None
}

/// Fail-open variant: unparseable input collapses to the reference instant.
pub fn absolute_or_reference(raw: Option<&str>, reference: DateTime<Utc>) -> DateTime<Utc> {
    derive_absolute(raw, reference).unwrap_or(reference)
}

/// Re-render free text into the canonical relative phrase set
/// `{today, yesterday, "<n> days ago", "<n> months ago", "<n> years ago"}`.
/// Returns `None` for empty or unrecognized input — unlike the absolute
/// conversion, "unknown" is signalled explicitly here.
pub fn relative_phrase(raw: Option<&str>, reference: DateTime<Utc>) -> Option<String> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    let lower = raw.to_lowercase();

    if let Some(c) = REL_SHORT_DAYS.captures(&lower) {
        return Some(format!("{} days ago", &c[1]));
    }
    if let Some(c) = REL_DAYS_AGO.captures(&lower) {
        return Some(format!("{} days ago", &c[1]));
    }
    if let Some(c) = REL_MONTHS.captures(&lower) {
        return Some(format!("{} months ago", &c[1]));
    }
    if let Some(c) = REL_YEARS.captures(&lower) {
        return Some(format!("{} years ago", &c[1]));
    }
    if lower == "new" || lower == "today" {
        return Some("today".to_string());
    }
    if lower == "yesterday" {
        return Some("yesterday".to_string());
    }
    if let Some(c) = REL_POSTED.captures(&lower) {
        // Hours and weeks are not part of the canonical set; convert to
        // whole days and bucket.
        let value: i64 = c[1].parse().ok()?;
        let days = match c[2].chars().next() {
            Some('h') => 0,
            Some('d') => value,
            Some('w') => value * 7,
            Some('m') => value * 30,
            _ => value * 365,
        };
        return Some(bucket_days(days));
    }
    if let Some(c) = REL_DAYS_PLUS.captures(&lower) {
        return Some(format!("{} days ago", &c[1]));
    }
    if let Some(dt) = parse_absolute(raw) {
        return Some(bucket_days((reference - dt).num_days()));
    }
    None
}

fn bucket_days(days: i64) -> String {
    if days <= 0 {
        return "today".to_string();
    }
    if days == 1 {
        return "yesterday".to_string();
    }
    if days < 30 {
        return format!("{days} days ago");
    }
    let months = days / 30;
    if months < 12 {
        return format!("{months} months ago");
    }
    format!("{} years ago", months / 12)
}
