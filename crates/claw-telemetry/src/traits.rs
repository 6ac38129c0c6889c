//! Seams for the pipeline's external collaborators.
//!
//! This module provides:
//! - [`Transport`] - Delivers an encoded batch and reports the HTTP status
//! - [`RecordReader`] - Produces raw records from a journal or container source
//!
//! Both traits return boxed futures so they stay object safe and can be
//! swapped for in-memory fakes in tests.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::normalizer::RawRecord;
use crate::source::LogSource;

/// An encoded batch ready to be posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    /// Target URL.
    pub url: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Compressed body.
    pub body: Vec<u8>,
}

impl ExportRequest {
    /// Returns the first header value with the given name, ignoring case.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Delivers export requests to the collector.
pub trait Transport: Send + Sync {
    /// Posts the request and returns the HTTP status code.
    ///
    /// # Errors
    ///
    /// Returns `TelemetryError::Transport` if no response was received.
    fn post<'a>(
        &'a self,
        request: ExportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<u16>> + Send + 'a>>;
}

/// Reads records produced by a source since a point in time.
pub trait RecordReader: Send {
    /// Returns records for `source` newer than `since`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing command is missing, fails or times out.
    fn read<'a>(
        &'a mut self,
        source: &'a LogSource,
        since: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RawRecord>>> + Send + 'a>>;
}

/// Reader that never yields anything, for hosts without the backing tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReader;

impl RecordReader for NullReader {
    fn read<'a>(
        &'a mut self,
        _source: &'a LogSource,
        _since: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RawRecord>>> + Send + 'a>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}
