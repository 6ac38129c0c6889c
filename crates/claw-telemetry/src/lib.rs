//! # claw-telemetry
//!
//! Host log collection and export pipeline for Clawbernetes nodes.
//!
//! This crate provides:
//!
//! - [`SourceRegistry`] - Discovery of log files, the journal and container runtimes
//! - [`TailerSet`] - Incremental file tailing with rotation handling
//! - [`Stitcher`] / [`Normalizer`] - Multiline stitching, severity and timestamps
//! - [`Deduplicator`] - Time-windowed content-hash suppression
//! - [`EntryBuffer`] / [`SpillStore`] - Bounded memory queue with disk spillover
//! - [`Exporter`] - Gzip JSON batches with bounded retry
//! - [`Pipeline`] - Collection and flush loops with graceful shutdown
//!
//! ## Example
//!
//! ```rust,no_run
//! use claw_telemetry::{LogSource, Pipeline, PipelineConfig};
//!
//! # async fn run() -> claw_telemetry::Result<()> {
//! let config = PipelineConfig::new("pipeline-1", "api-key")
//!     .with_source(LogSource::file("/var/log/myapp/*.log"))
//!     .with_auto_discover(false);
//!
//! let pipeline = Pipeline::new(config)?;
//! pipeline.start().await?;
//! // ...
//! pipeline.stop().await?;
//! println!("{:?}", pipeline.stats());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod buffer;
pub mod config;
pub mod container;
pub mod dedup;
pub mod error;
pub mod export;
pub mod journal;
pub mod multiline;
pub mod normalizer;
pub mod pipeline;
pub mod source;
pub mod spill;
pub mod stats;
pub mod tailer;
pub mod traits;
pub mod types;

// Re-export main types
pub use buffer::EntryBuffer;
pub use config::PipelineConfig;
pub use container::ContainerReader;
pub use dedup::Deduplicator;
pub use error::{Result, TelemetryError};
pub use export::{ExportError, Exporter, HttpTransport};
pub use journal::JournalReader;
pub use multiline::{RawLine, Stitcher};
pub use normalizer::{Normalizer, Origin, RawRecord, StructuredRecord};
pub use pipeline::{Pipeline, PipelineState};
pub use source::{LogSource, SourceRegistry};
pub use spill::SpillStore;
pub use stats::{Stats, StatsSnapshot};
pub use tailer::{FileTailer, TailerSet};
pub use traits::{ExportRequest, NullReader, RecordReader, Transport};
pub use types::{LogEntry, Severity, SourceKind};
