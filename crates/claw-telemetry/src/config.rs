//! Pipeline configuration.
//!
//! The hosting process builds a [`PipelineConfig`] (from its own config file,
//! flags or environment) and hands it to [`crate::Pipeline::new`]. Only
//! validation and defaults live here.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TelemetryError};
use crate::source::LogSource;

/// Default collector endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://telemetry.clawbernetes.dev/v1/logs";

/// Host identifier used when none is configured and the hostname is unreadable.
pub const UNKNOWN_HOST: &str = "unknown-host";

/// Configuration for the log collection and export pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Opaque pipeline identity, sent with every batch.
    pub pipeline_id: String,
    /// Bearer credential for the collector.
    pub api_key: String,
    /// Host identifier; empty means "use the system hostname".
    pub host_id: String,
    /// Collector URL receiving gzip JSON batches.
    pub endpoint: String,
    /// Explicitly configured sources.
    pub sources: Vec<LogSource>,
    /// Additional file paths (or globs) to tail.
    pub extra_paths: Vec<PathBuf>,
    /// Whether to auto-detect well-known sources at startup.
    pub auto_discover: bool,
    /// Interval between collection ticks, in milliseconds.
    pub collect_interval_ms: u64,
    /// Interval between flushes, in milliseconds.
    pub flush_interval_ms: u64,
    /// Maximum entries per exported batch.
    pub batch_size: usize,
    /// Maximum entries held in memory.
    pub max_buffer_entries: usize,
    /// Window within which identical entries are collapsed, in milliseconds.
    pub dedup_window_ms: u64,
    /// Age after which dedup hashes are purged, in milliseconds.
    pub dedup_horizon_ms: u64,
    /// Per-request HTTP timeout, in seconds.
    pub request_timeout_secs: u64,
    /// Send attempts per batch before giving up.
    pub max_attempts: u32,
    /// Backoff before the second attempt, doubled afterwards, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Directory for spilled batches; `None` uses the per-user data dir.
    pub spill_dir: Option<PathBuf>,
    /// Maximum spilled batch files kept on disk.
    pub max_spill_files: usize,
    /// Upper bound on journal/container lookback after a pause, in seconds.
    pub journal_max_lookback_secs: u64,
    /// Timeout for journalctl/docker invocations, in seconds.
    pub command_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline_id: String::new(),
            api_key: String::new(),
            host_id: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            sources: Vec::new(),
            extra_paths: Vec::new(),
            auto_discover: true,
            collect_interval_ms: 5_000,
            flush_interval_ms: 30_000,
            batch_size: 500,
            max_buffer_entries: 10_000,
            dedup_window_ms: 10_000,
            dedup_horizon_ms: 5 * 60 * 1000,
            request_timeout_secs: 30,
            max_attempts: 3,
            retry_base_delay_ms: 1_000,
            spill_dir: None,
            max_spill_files: 1_000,
            journal_max_lookback_secs: 10 * 60,
            command_timeout_secs: 10,
        }
    }
}

impl PipelineConfig {
    /// Creates a config with the given identity and credential.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            api_key: api_key.into(),
            ..Default::default()
        }
    }

    /// Sets the host identifier.
    #[must_use]
    pub fn with_host_id(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = host_id.into();
        self
    }

    /// Sets the collector endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Adds an explicit source.
    #[must_use]
    pub fn with_source(mut self, source: LogSource) -> Self {
        self.sources.push(source);
        self
    }

    /// Adds an extra file path to tail.
    #[must_use]
    pub fn with_extra_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.extra_paths.push(path.into());
        self
    }

    /// Enables or disables auto-discovery.
    #[must_use]
    pub const fn with_auto_discover(mut self, enabled: bool) -> Self {
        self.auto_discover = enabled;
        self
    }

    /// Sets the spill directory.
    #[must_use]
    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    /// Returns the collection interval.
    #[must_use]
    pub const fn collect_interval(&self) -> Duration {
        Duration::from_millis(self.collect_interval_ms)
    }

    /// Returns the flush interval.
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Returns the dedup window.
    #[must_use]
    pub const fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    /// Returns the dedup cleanup horizon.
    #[must_use]
    pub const fn dedup_horizon(&self) -> Duration {
        Duration::from_millis(self.dedup_horizon_ms)
    }

    /// Returns the per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Returns the base retry delay.
    #[must_use]
    pub const fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Returns the maximum journal/container lookback.
    #[must_use]
    pub const fn journal_max_lookback(&self) -> Duration {
        Duration::from_secs(self.journal_max_lookback_secs)
    }

    /// Returns the helper command timeout.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Returns the configured host id, falling back to the system hostname.
    #[must_use]
    pub fn resolved_host_id(&self) -> String {
        let configured = self.host_id.trim();
        if !configured.is_empty() {
            return configured.to_string();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| UNKNOWN_HOST.to_string())
    }

    /// Returns the spill directory, defaulting to the per-user data dir.
    #[must_use]
    pub fn resolved_spill_dir(&self) -> PathBuf {
        self.spill_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("claw-telemetry")
                .join("spill")
        })
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline_id.trim().is_empty() {
            return Err(TelemetryError::Config(
                "pipeline_id cannot be empty".to_string(),
            ));
        }

        if self.api_key.trim().is_empty() {
            return Err(TelemetryError::Config("api_key cannot be empty".to_string()));
        }

        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(TelemetryError::Config(
                "endpoint must start with http:// or https://".to_string(),
            ));
        }

        let positive = [
            ("collect_interval_ms", self.collect_interval_ms),
            ("flush_interval_ms", self.flush_interval_ms),
            ("batch_size", self.batch_size as u64),
            ("max_buffer_entries", self.max_buffer_entries as u64),
            ("request_timeout_secs", self.request_timeout_secs),
            ("max_attempts", u64::from(self.max_attempts)),
            ("max_spill_files", self.max_spill_files as u64),
            ("command_timeout_secs", self.command_timeout_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(TelemetryError::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.dedup_horizon_ms < self.dedup_window_ms {
            return Err(TelemetryError::Config(
                "dedup_horizon_ms must not be shorter than dedup_window_ms".to_string(),
            ));
        }

        for source in &self.sources {
            source.validate()?;
        }

        Ok(())
    }
}
