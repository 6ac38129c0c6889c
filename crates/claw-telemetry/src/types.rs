//! Core types for the telemetry pipeline.
//!
//! This module provides:
//! - [`Severity`] - Ordered severity levels with OTLP severity numbers
//! - [`SourceKind`] - Where an entry was collected from
//! - [`LogEntry`] - The normalized, exportable unit
//! - [`truncate_message`] - Char-boundary safe message capping

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum size of an entry message in bytes, marker included.
pub const MAX_MESSAGE_BYTES: usize = 32 * 1024;

/// Suffix appended to messages cut at [`MAX_MESSAGE_BYTES`].
pub const TRUNCATION_MARKER: &str = " ...[truncated]";

/// Log severity levels, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Most verbose, detailed tracing information
    Trace = 0,
    /// Debugging information
    Debug = 1,
    /// General information
    #[default]
    Info = 2,
    /// Warning conditions
    Warn = 3,
    /// Error conditions
    Error = 4,
    /// Unrecoverable failures
    Fatal = 5,
}

impl Severity {
    /// Returns true if this level is at least as severe as the given level.
    #[must_use]
    pub fn is_at_least(&self, level: Self) -> bool {
        *self >= level
    }

    /// Returns the lowercase name of this level.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }

    /// Returns the OTLP severity text.
    #[must_use]
    pub const fn otlp_text(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }

    /// Returns the OTLP severity number (first value of each range).
    #[must_use]
    pub const fn otlp_number(&self) -> u8 {
        match self {
            Self::Trace => 1,
            Self::Debug => 5,
            Self::Info => 9,
            Self::Warn => 13,
            Self::Error => 17,
            Self::Fatal => 21,
        }
    }

    /// Maps a syslog/journal priority (0 = emerg .. 7 = debug) to a severity.
    #[must_use]
    pub const fn from_priority(priority: u8) -> Self {
        match priority {
            0..=2 => Self::Fatal,
            3 => Self::Error,
            4 => Self::Warn,
            7 => Self::Debug,
            _ => Self::Info,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of source an entry was collected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A tailed file
    File,
    /// The system journal
    Journal,
    /// A container runtime log stream
    Container,
}

impl SourceKind {
    /// Returns the lowercase name of this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Journal => "journal",
            Self::Container => "container",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized log entry ready for export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the entry was produced (or collected, if unknown)
    pub timestamp: DateTime<Utc>,
    /// Severity level
    pub severity: Severity,
    /// The message, capped at [`MAX_MESSAGE_BYTES`]
    pub message: String,
    /// Kind of source
    pub source: SourceKind,
    /// Path, journal unit or container id
    pub locator: String,
    /// Best-effort service label
    pub service: String,
    /// Producing process, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Host identifier
    pub host: String,
    /// Additional structured fields
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,
    /// Content hash over kind, service, severity and message
    pub content_hash: String,
}

impl LogEntry {
    /// Creates an entry, capping the message and deriving its content hash.
    #[must_use]
    pub fn new(
        timestamp: DateTime<Utc>,
        severity: Severity,
        message: impl Into<String>,
        source: SourceKind,
        locator: impl Into<String>,
        service: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        let message = truncate_message(message.into());
        let service = service.into();
        let content_hash = content_hash(source, &service, severity, &message);
        Self {
            timestamp,
            severity,
            message,
            source,
            locator: locator.into(),
            service,
            pid: None,
            host: host.into(),
            fields: BTreeMap::new(),
            content_hash,
        }
    }

    /// Sets the producing process id.
    #[must_use]
    pub const fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    /// Replaces the structured fields.
    #[must_use]
    pub fn with_fields(mut self, fields: BTreeMap<String, serde_json::Value>) -> Self {
        self.fields = fields;
        self
    }

    /// Returns the container id for container entries.
    #[must_use]
    pub fn container_id(&self) -> Option<&str> {
        (self.source == SourceKind::Container).then_some(self.locator.as_str())
    }
}

/// Computes the dedup/identity hash of an entry's content.
#[must_use]
pub fn content_hash(
    source: SourceKind,
    service: &str,
    severity: Severity,
    message: &str,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(service.as_bytes());
    hasher.update(&[0]);
    hasher.update(severity.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(message.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Caps a message at [`MAX_MESSAGE_BYTES`], appending [`TRUNCATION_MARKER`].
///
/// The cut always lands on a char boundary.
#[must_use]
pub fn truncate_message(message: String) -> String {
    if message.len() <= MAX_MESSAGE_BYTES {
        return message;
    }
    let mut cut = MAX_MESSAGE_BYTES - TRUNCATION_MARKER.len();
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = message;
    truncated.truncate(cut);
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}
