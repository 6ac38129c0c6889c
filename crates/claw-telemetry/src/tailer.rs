//! Incremental file tailing.
//!
//! This module provides:
//! - [`FileTailer`] - The read cursor of a single file
//! - [`TailerSet`] - Cursors keyed by path, with rotation detection
//!
//! Rotation is detected by the file shrinking below the stored offset (or,
//! on unix, by the inode changing). Either way the file is re-read from
//! byte 0, which can re-emit a little old data but never skips new data.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::Result;

/// Longest line kept, in bytes; longer lines are cut but still consumed.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Most bytes read from one file in one tick.
pub const MAX_READ_BYTES: u64 = 16 * 1024 * 1024;

/// Read cursor of a single file.
#[derive(Debug, Clone)]
pub struct FileTailer {
    /// Tailed path.
    pub path: PathBuf,
    /// Next byte to read.
    pub offset: u64,
    /// Size observed on the last read.
    pub last_size: u64,
    /// Modification time observed on the last read.
    pub last_modified: Option<SystemTime>,
    /// Device/inode pair observed on the last read.
    pub identity: Option<(u64, u64)>,
    /// Service label attached to lines from this file.
    pub service: String,
    /// Wall-clock time of the last read that returned data.
    pub last_read: Option<DateTime<Utc>>,
}

impl FileTailer {
    /// Creates a cursor at the given offset.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, offset: u64, service: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            offset,
            last_size: offset,
            last_modified: None,
            identity: None,
            service: service.into(),
            last_read: None,
        }
    }

    /// Reads every complete or partial line appended since the last call.
    ///
    /// The offset is advanced before the lines are returned, so bytes that
    /// were read are never read again even if the caller drops them.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, inspected or read.
    pub fn read_new_lines(&mut self) -> Result<Vec<String>> {
        let mut file = File::open(&self.path)?;
        let metadata = file.metadata()?;
        let size = metadata.len();
        let identity = file_identity(&metadata);

        let rotated_by_identity =
            matches!((self.identity, identity), (Some(old), Some(new)) if old != new);
        if size < self.offset || rotated_by_identity {
            info!(
                path = %self.path.display(),
                offset = self.offset,
                size,
                "file rotated or truncated, rereading from start"
            );
            self.offset = 0;
        }

        self.identity = identity;
        self.last_modified = metadata.modified().ok();
        self.last_size = size;

        if size == self.offset {
            return Ok(Vec::new());
        }

        let to_read = (size - self.offset).min(MAX_READ_BYTES);
        file.seek(SeekFrom::Start(self.offset))?;
        let mut bytes = Vec::with_capacity(usize::try_from(to_read).unwrap_or(0));
        file.by_ref().take(to_read).read_to_end(&mut bytes)?;

        self.offset += bytes.len() as u64;
        self.last_read = Some(Utc::now());

        Ok(split_lines(&bytes))
    }
}

/// Splits raw bytes into trimmed, non-blank lines capped at [`MAX_LINE_BYTES`].
fn split_lines(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|b| *b == b'\n')
        .filter_map(|raw| {
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            let raw = &raw[..raw.len().min(MAX_LINE_BYTES)];
            let line = String::from_utf8_lossy(raw);
            if line.trim().is_empty() {
                None
            } else {
                Some(line.into_owned())
            }
        })
        .collect()
}

#[cfg(unix)]
fn file_identity(metadata: &std::fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn file_identity(_metadata: &std::fs::Metadata) -> Option<(u64, u64)> {
    None
}

/// File cursors keyed by path.
///
/// Owned by the collection loop alone, so it carries no lock.
#[derive(Debug, Default)]
pub struct TailerSet {
    tailers: HashMap<PathBuf, FileTailer>,
    primed: bool,
}

impl TailerSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the end of the first scan.
    ///
    /// Files first seen before this start at end-of-file; files first seen
    /// after it start at byte 0.
    pub fn mark_primed(&mut self) {
        self.primed = true;
    }

    /// Returns true once the first scan has completed.
    #[must_use]
    pub const fn is_primed(&self) -> bool {
        self.primed
    }

    /// Reads new lines from `path`, creating its cursor on first sight.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read this tick.
    pub fn tail(&mut self, path: &Path, service: &str) -> Result<Vec<String>> {
        if !self.tailers.contains_key(path) {
            let offset = if self.primed {
                0
            } else {
                std::fs::metadata(path)?.len()
            };
            debug!(path = %path.display(), offset, "tracking new file");
            let mut tailer = FileTailer::new(path, offset, service);
            if let Ok(metadata) = std::fs::metadata(path) {
                tailer.identity = file_identity(&metadata);
            }
            self.tailers.insert(path.to_path_buf(), tailer);
        }

        match self.tailers.get_mut(path) {
            Some(tailer) => tailer.read_new_lines(),
            None => Ok(Vec::new()),
        }
    }

    /// Returns the cursor for a path.
    #[must_use]
    pub fn get(&self, path: &Path) -> Option<&FileTailer> {
        self.tailers.get(path)
    }

    /// Returns the number of tracked files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tailers.len()
    }

    /// Returns true if no files are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tailers.is_empty()
    }
}
