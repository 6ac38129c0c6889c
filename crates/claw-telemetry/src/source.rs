//! Log source registry.
//!
//! This module provides:
//! - [`LogSource`] - A configured or discovered origin of log data
//! - [`SourceRegistry`] - Discovery of well-known sources plus explicit registration
//! - [`infer_service`] - Path → service label lookup

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TelemetryError};
use crate::types::SourceKind;

/// Well-known log file globs, relative to the filesystem root.
const WELL_KNOWN_GLOBS: &[&str] = &[
    "var/log/syslog",
    "var/log/messages",
    "var/log/auth.log",
    "var/log/kern.log",
    "var/log/nginx/*.log",
    "var/log/apache2/*.log",
    "var/log/httpd/*log",
    "var/log/mysql/*.log",
    "var/log/postgresql/*.log",
    "var/log/redis/*.log",
    "var/log/mongodb/*.log",
    "var/log/rabbitmq/*.log",
];

/// Paths whose presence indicates a systemd journal.
const JOURNAL_MARKERS: &[&str] = &["run/systemd/journal", "var/log/journal"];

/// Paths whose presence indicates a container runtime.
const CONTAINER_SOCKETS: &[&str] = &["var/run/docker.sock", "run/docker.sock"];

/// Path substring → service label, checked in order.
const SERVICE_TABLE: &[(&str, &str)] = &[
    ("nginx", "nginx"),
    ("apache", "apache"),
    ("httpd", "apache"),
    ("mysql", "mysql"),
    ("mariadb", "mysql"),
    ("postgres", "postgresql"),
    ("redis", "redis"),
    ("mongo", "mongodb"),
    ("rabbitmq", "rabbitmq"),
    ("docker", "docker"),
    ("syslog", "syslog"),
    ("messages", "syslog"),
    ("auth.log", "auth"),
    ("kern.log", "kernel"),
];

/// A configured or discovered origin of log data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSource {
    /// Kind of source.
    pub kind: SourceKind,
    /// File path or glob, journal unit (empty = all), or container name filter (empty = all).
    #[serde(default)]
    pub target: String,
    /// Glob patterns a path must match (empty = everything).
    #[serde(default)]
    pub include: Vec<String>,
    /// Glob patterns that exclude a path.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Service label override.
    #[serde(default)]
    pub service: Option<String>,
}

impl LogSource {
    /// Creates a file source for a path or glob.
    #[must_use]
    pub fn file(target: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::File,
            target: target.into(),
            include: Vec::new(),
            exclude: Vec::new(),
            service: None,
        }
    }

    /// Creates a journal source; an empty unit reads every unit.
    #[must_use]
    pub fn journal(unit: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::Journal,
            ..Self::file(unit)
        }
    }

    /// Creates a container source; an empty filter reads every running container.
    #[must_use]
    pub fn container(name_filter: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::Container,
            ..Self::file(name_filter)
        }
    }

    /// Adds an include pattern.
    #[must_use]
    pub fn with_include(mut self, pattern: impl Into<String>) -> Self {
        self.include.push(pattern.into());
        self
    }

    /// Adds an exclude pattern.
    #[must_use]
    pub fn with_exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    /// Sets the service label override.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Checks that the source is usable.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty file target or malformed patterns.
    pub fn validate(&self) -> Result<()> {
        if self.kind == SourceKind::File && self.target.trim().is_empty() {
            return Err(TelemetryError::Config(
                "file source target cannot be empty".to_string(),
            ));
        }
        for pattern in self.include.iter().chain(&self.exclude) {
            glob::Pattern::new(pattern).map_err(|e| {
                TelemetryError::Config(format!("invalid pattern '{pattern}': {e}"))
            })?;
        }
        Ok(())
    }

    /// Returns true if the path passes the include/exclude patterns.
    #[must_use]
    pub fn admits(&self, path: &Path) -> bool {
        let matches = |pattern: &String| {
            glob::Pattern::new(pattern).is_ok_and(|p| p.matches_path(path))
        };
        if !self.include.is_empty() && !self.include.iter().any(matches) {
            return false;
        }
        !self.exclude.iter().any(matches)
    }

    /// Returns the service label for a path produced by this source.
    #[must_use]
    pub fn service_for(&self, path: &Path) -> String {
        self.service
            .clone()
            .unwrap_or_else(|| infer_service(path))
    }
}

/// Registry of the sources collected each tick.
///
/// Sources are immutable once registered; new ones may be appended at any time.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: Vec<LogSource>,
}

impl SourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Discovers well-known sources on this host.
    #[must_use]
    pub fn discover() -> Vec<LogSource> {
        Self::discover_under(Path::new("/"))
    }

    /// Discovers well-known sources below `root`.
    ///
    /// Missing or unreadable paths are skipped silently.
    #[must_use]
    pub fn discover_under(root: &Path) -> Vec<LogSource> {
        let mut found = Vec::new();

        for relative in WELL_KNOWN_GLOBS {
            let pattern = root.join(relative);
            let pattern = pattern.to_string_lossy();
            if expand_glob(&pattern).iter().any(|p| is_readable(p)) {
                debug!(pattern = %pattern, "discovered log files");
                found.push(LogSource::file(pattern.into_owned()));
            }
        }

        if JOURNAL_MARKERS.iter().any(|m| root.join(m).exists()) {
            debug!("discovered system journal");
            found.push(LogSource::journal(""));
        }

        if CONTAINER_SOCKETS.iter().any(|s| root.join(s).exists()) {
            debug!("discovered container runtime socket");
            found.push(LogSource::container(""));
        }

        found
    }

    /// Registers a source unless an identical kind/target is already present.
    pub fn register(&mut self, source: LogSource) {
        let duplicate = self
            .sources
            .iter()
            .any(|s| s.kind == source.kind && s.target == source.target);
        if !duplicate {
            self.sources.push(source);
        }
    }

    /// Registers explicit file paths (or globs) as file sources.
    pub fn register_custom<P: AsRef<Path>>(&mut self, paths: &[P]) {
        for path in paths {
            self.register(LogSource::file(path.as_ref().to_string_lossy().into_owned()));
        }
    }

    /// Returns the registered sources.
    #[must_use]
    pub fn sources(&self) -> &[LogSource] {
        &self.sources
    }

    /// Returns the registered sources of one kind.
    pub fn of_kind(&self, kind: SourceKind) -> impl Iterator<Item = &LogSource> {
        self.sources.iter().filter(move |s| s.kind == kind)
    }

    /// Returns the number of registered sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns true if no sources are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Resolves a file source to the concrete paths it currently matches.
    #[must_use]
    pub fn expand(source: &LogSource) -> Vec<PathBuf> {
        if source.kind != SourceKind::File {
            return Vec::new();
        }
        let mut paths: Vec<PathBuf> = expand_glob(&source.target)
            .into_iter()
            .filter(|p| p.is_file() && source.admits(p))
            .collect();
        paths.sort();
        paths
    }
}

/// Maps a path to a service label via [`SERVICE_TABLE`], falling back to the file stem.
#[must_use]
pub fn infer_service(path: &Path) -> String {
    let lowered = path.to_string_lossy().to_lowercase();
    for (needle, service) in SERVICE_TABLE {
        if lowered.contains(needle) {
            return (*service).to_string();
        }
    }
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn expand_glob(pattern: &str) -> Vec<PathBuf> {
    match glob::glob(pattern) {
        Ok(paths) => paths.filter_map(std::result::Result::ok).collect(),
        Err(e) => {
            debug!(pattern, error = %e, "invalid glob pattern");
            Vec::new()
        }
    }
}

fn is_readable(path: &Path) -> bool {
    path.is_file() && std::fs::File::open(path).is_ok()
}
