//! Normalization of raw lines and records into [`LogEntry`] values.
//!
//! This module provides:
//! - [`classify_severity`] - Ordered keyword cascade for free text
//! - [`extract_timestamp`] - Best-effort timestamp parsing of a line prefix
//! - [`RawRecord`] - What readers hand to the normalizer
//! - [`Normalizer`] - Stitches, classifies and stamps records

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::multiline::{RawLine, Stitcher};
use crate::types::{LogEntry, Severity, SourceKind};

/// Bytes of a line inspected for a leading timestamp.
pub const TIMESTAMP_PREFIX_BYTES: usize = 64;

/// Severity keyword cascade; the first matching tier wins.
static SEVERITY_CASCADE: Lazy<Vec<(Regex, Severity)>> = Lazy::new(|| {
    [
        (
            r"(?i)\b(?:fatal|critical|crit|emerg|emergency|alert)\b",
            Severity::Fatal,
        ),
        // Exception and error names match as suffixes so class names like
        // `OutOfMemoryError` and plurals like `errors` classify.
        (
            r"(?i)\b(?:err|panic|panicked|traceback)\b|(?:exception|error)s?\b",
            Severity::Error,
        ),
        (r"(?i)\bwarn(?:ing)?s?\b", Severity::Warn),
        (r"(?i)\bdebug\b", Severity::Debug),
        (r"(?i)\btrace\b", Severity::Trace),
    ]
    .into_iter()
    .map(|(pattern, severity)| {
        (
            Regex::new(pattern).unwrap_or_else(|_| unreachable!()),
            severity,
        )
    })
    .collect()
});

/// Naive formats tried after RFC 3339, in order.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Classifies free text with the keyword cascade, defaulting to `Info`.
#[must_use]
pub fn classify_severity(message: &str) -> Severity {
    SEVERITY_CASCADE
        .iter()
        .find(|(pattern, _)| pattern.is_match(message))
        .map_or(Severity::Info, |(_, severity)| *severity)
}

/// Parses a level name such as `"warning"` or `"ERR"`.
#[must_use]
pub fn parse_level_name(name: &str) -> Option<Severity> {
    match name.trim().to_lowercase().as_str() {
        "trace" | "trc" => Some(Severity::Trace),
        "debug" | "dbg" => Some(Severity::Debug),
        "info" | "inf" | "notice" => Some(Severity::Info),
        "warn" | "warning" | "wrn" => Some(Severity::Warn),
        "error" | "err" => Some(Severity::Error),
        "fatal" | "critical" | "crit" | "panic" | "emerg" | "alert" => Some(Severity::Fatal),
        _ => None,
    }
}

/// Extracts a leading timestamp from a line, if one of the known formats matches.
///
/// Naive timestamps are read in the host's local zone. Year-less syslog
/// stamps are assumed to be in the current year.
#[must_use]
pub fn extract_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let prefix = bounded_prefix(line.trim_start_matches('['), TIMESTAMP_PREFIX_BYTES);

    if let Some(token) = prefix.split_whitespace().next() {
        let token = token.trim_end_matches([']', ',', ':']);
        if let Ok(parsed) = DateTime::parse_from_rfc3339(token) {
            return Some(parsed.with_timezone(&Utc));
        }
    }

    for format in NAIVE_FORMATS {
        if let Ok((naive, _)) = NaiveDateTime::parse_and_remainder(prefix, format) {
            return local_to_utc(naive);
        }
    }

    if let Some(ts) = parse_syslog_stamp(prefix) {
        return Some(ts);
    }

    if let Ok((naive, _)) = NaiveDateTime::parse_and_remainder(prefix, "%Y/%m/%d %H:%M:%S") {
        return local_to_utc(naive);
    }

    if let Ok((date, _)) = NaiveDate::parse_and_remainder(prefix, "%Y-%m-%d") {
        return local_to_utc(date.and_hms_opt(0, 0, 0)?);
    }

    None
}

fn parse_syslog_stamp(prefix: &str) -> Option<DateTime<Utc>> {
    let mut parts = prefix.split_whitespace();
    let month = parts.next()?;
    let day = parts.next()?;
    let time = parts.next()?;
    if month.len() != 3 || !month.chars().all(char::is_alphabetic) {
        return None;
    }
    let year = Local::now().year();
    let candidate = format!("{year} {month} {day} {time}");
    let naive = NaiveDateTime::parse_from_str(&candidate, "%Y %b %d %H:%M:%S").ok()?;
    local_to_utc(naive)
}

fn local_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn bounded_prefix(line: &str, max: usize) -> &str {
    if line.len() <= max {
        return line;
    }
    let mut cut = max;
    while !line.is_char_boundary(cut) {
        cut -= 1;
    }
    &line[..cut]
}

/// Where a record came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// Kind of source.
    pub kind: SourceKind,
    /// Path, journal unit or container id.
    pub locator: String,
    /// Service label.
    pub service: String,
    /// Producing process, when known.
    pub pid: Option<u32>,
}

impl Origin {
    /// Creates an origin.
    #[must_use]
    pub fn new(kind: SourceKind, locator: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            kind,
            locator: locator.into(),
            service: service.into(),
            pid: None,
        }
    }
}

/// A complete structured record, such as a journal entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredRecord {
    /// Where the record came from.
    pub origin: Origin,
    /// Timestamp reported by the source.
    pub timestamp: Option<DateTime<Utc>>,
    /// Numeric syslog priority, if reported.
    pub priority: Option<u8>,
    /// Message body.
    pub message: String,
    /// Extra structured fields.
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// Output of a source reader.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    /// Free-text lines from one origin, still to be stitched.
    Lines {
        /// Where the lines came from.
        origin: Origin,
        /// The lines, in order.
        lines: Vec<RawLine>,
    },
    /// A complete structured record.
    Structured(StructuredRecord),
}

/// Turns raw records into normalized entries.
#[derive(Debug, Clone)]
pub struct Normalizer {
    host: String,
}

impl Normalizer {
    /// Creates a normalizer stamping entries with `host`.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    /// Returns the host identifier.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Normalizes a record; `now` is used when no timestamp can be found.
    #[must_use]
    pub fn normalize(&self, record: RawRecord, now: DateTime<Utc>) -> Vec<LogEntry> {
        match record {
            RawRecord::Lines { origin, lines } => {
                let mut stitcher = Stitcher::new();
                stitcher
                    .stitch_all(lines)
                    .into_iter()
                    .map(|line| self.from_line(&origin, line, now))
                    .collect()
            }
            RawRecord::Structured(record) => vec![self.from_structured(record, now)],
        }
    }

    fn from_line(&self, origin: &Origin, line: RawLine, now: DateTime<Utc>) -> LogEntry {
        let first_line = line.text.lines().next().unwrap_or_default();
        let json_level = json_level(first_line);
        let severity = json_level.unwrap_or_else(|| classify_severity(&line.text));
        let timestamp = line
            .timestamp
            .or_else(|| extract_timestamp(first_line))
            .unwrap_or(now);

        LogEntry::new(
            timestamp,
            severity,
            line.text,
            origin.kind,
            origin.locator.clone(),
            origin.service.clone(),
            self.host.clone(),
        )
        .with_pid(origin.pid)
    }

    fn from_structured(&self, record: StructuredRecord, now: DateTime<Utc>) -> LogEntry {
        let severity = record
            .priority
            .map_or_else(|| classify_severity(&record.message), Severity::from_priority);

        LogEntry::new(
            record.timestamp.unwrap_or(now),
            severity,
            record.message,
            record.origin.kind,
            record.origin.locator,
            record.origin.service,
            self.host.clone(),
        )
        .with_pid(record.origin.pid)
        .with_fields(record.fields)
    }
}

/// Reads a level field from a JSON log line.
fn json_level(line: &str) -> Option<Severity> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let json: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    let obj = json.as_object()?;
    ["level", "lvl", "severity"]
        .iter()
        .filter_map(|key| obj.get(*key)?.as_str())
        .find_map(parse_level_name)
}
