//! On-disk spillover for batches that could not be delivered.
//!
//! Each batch is a JSON array in its own file, written as `*.json.tmp`,
//! fsynced and then renamed to `*.json`. A crash therefore leaves either a
//! complete batch or a stale temp file, never a half-written batch. File
//! names sort by creation time, which is the reload order.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::LogEntry;

const BATCH_PREFIX: &str = "batch-";
const BATCH_EXT: &str = ".json";
const TMP_EXT: &str = ".json.tmp";

/// Directory of spilled batches.
#[derive(Debug)]
pub struct SpillStore {
    dir: PathBuf,
    max_files: usize,
    file_seq: AtomicU64,
    corrupt_files: AtomicU64,
}

impl SpillStore {
    /// Creates a store rooted at `dir`; the directory is created on first spill.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, max_files: usize) -> Self {
        Self {
            dir: dir.into(),
            max_files: max_files.max(1),
            file_seq: AtomicU64::new(0),
            corrupt_files: AtomicU64::new(0),
        }
    }

    /// Returns the spill directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns how many corrupt files have been discarded so far.
    #[must_use]
    pub fn corrupt_files(&self) -> u64 {
        self.corrupt_files.load(Ordering::Relaxed)
    }

    /// Writes a batch atomically and returns its final path.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn spill(&self, entries: &[LogEntry]) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let name = self.generate_filename();
        let tmp = self.dir.join(format!("{name}{TMP_EXT}"));
        let path = self.dir.join(format!("{name}{BATCH_EXT}"));

        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, entries)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        debug!(path = %path.display(), entries = entries.len(), "spilled batch to disk");
        Ok(path)
    }

    /// Deletes the oldest batches beyond the file limit.
    ///
    /// Returns the number of entries those files held.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn prune(&self) -> Result<usize> {
        let files = self.batch_files()?;
        if files.len() <= self.max_files {
            return Ok(0);
        }

        let excess = files.len() - self.max_files;
        let mut dropped = 0;
        for path in &files[..excess] {
            dropped += read_batch(path).map_or(0, |batch| batch.len());
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to prune spilled batch");
            }
        }
        warn!(files = excess, entries = dropped, "spill limit reached, pruned oldest batches");
        Ok(dropped)
    }

    /// Reads every spilled batch in creation order, deleting each file after it is read.
    ///
    /// Stale temp files and corrupt batches are removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be listed.
    pub fn load_all(&self) -> Result<Vec<LogEntry>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        self.remove_stale_temps()?;

        let mut entries = Vec::new();
        let files = self.batch_files()?;
        for path in &files {
            match read_batch(path) {
                Ok(batch) => entries.extend(batch),
                Err(e) => {
                    self.corrupt_files.fetch_add(1, Ordering::Relaxed);
                    warn!(path = %path.display(), error = %e, "discarding corrupt spilled batch");
                }
            }
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove spilled batch");
            }
        }

        if !files.is_empty() {
            info!(files = files.len(), entries = entries.len(), "reloaded spilled batches");
        }
        Ok(entries)
    }

    /// Returns the number of complete batches on disk.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.batch_files().map_or(0, |files| files.len())
    }

    fn generate_filename(&self) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let seq = self.file_seq.fetch_add(1, Ordering::Relaxed);
        format!("{BATCH_PREFIX}{nanos:020}-{seq:06}")
    }

    fn batch_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy())
                    .is_some_and(|n| n.starts_with(BATCH_PREFIX) && n.ends_with(BATCH_EXT))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    fn remove_stale_temps(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)?.filter_map(std::result::Result::ok) {
            let path = entry.path();
            let is_tmp = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().ends_with(TMP_EXT));
            if is_tmp {
                debug!(path = %path.display(), "removing stale temp batch");
                let _ = fs::remove_file(&path);
            }
        }
        Ok(())
    }
}

fn read_batch(path: &Path) -> Result<Vec<LogEntry>> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Severity, SourceKind};
    use tempfile::TempDir;

    fn entries(prefix: &str, n: usize) -> Vec<LogEntry> {
        (0..n)
            .map(|i| {
                LogEntry::new(
                    Utc::now(),
                    Severity::Warn,
                    format!("{prefix}-{i}"),
                    SourceKind::Journal,
                    "sshd.service",
                    "sshd",
                    "host",
                )
                .with_pid(Some(7))
            })
            .collect()
    }

    fn make_store(max_files: usize) -> (SpillStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SpillStore::new(dir.path().join("spill"), max_files);
        (store, dir)
    }

    // ===========================================
    // Spill Tests
    // ===========================================

    #[test]
    fn spill_writes_final_file_only() {
        let (store, _dir) = make_store(10);
        let path = store.spill(&entries("a", 3)).unwrap();

        assert!(path.exists());
        assert!(path.to_string_lossy().ends_with(".json"));
        let names: Vec<String> = fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(!names[0].ends_with(".tmp"));
    }

    #[test]
    fn load_all_restores_in_order_and_deletes() {
        let (store, _dir) = make_store(10);
        store.spill(&entries("first", 2)).unwrap();
        store.spill(&entries("second", 1)).unwrap();

        let loaded = store.load_all().unwrap();
        let messages: Vec<&str> = loaded.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first-0", "first-1", "second-0"]);
        assert_eq!(loaded[0].pid, Some(7));
        assert_eq!(store.file_count(), 0);
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn load_all_without_directory_is_empty() {
        let (store, _dir) = make_store(10);
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn corrupt_and_temp_files_are_removed() {
        let (store, _dir) = make_store(10);
        store.spill(&entries("ok", 1)).unwrap();
        fs::write(store.dir().join("batch-00000000000000000001-000000.json"), "{not json").unwrap();
        fs::write(store.dir().join("batch-00000000000000000002-000000.json.tmp"), "[").unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(store.corrupt_files(), 1);
        assert_eq!(fs::read_dir(store.dir()).unwrap().count(), 0);
    }

    #[test]
    fn unrelated_files_are_ignored() {
        let (store, _dir) = make_store(10);
        store.spill(&entries("ok", 1)).unwrap();
        fs::write(store.dir().join("README"), "keep me").unwrap();

        assert_eq!(store.load_all().unwrap().len(), 1);
        assert!(store.dir().join("README").exists());
    }

    // ===========================================
    // Prune Tests
    // ===========================================

    #[test]
    fn prune_drops_oldest_beyond_limit() {
        let (store, _dir) = make_store(2);
        store.spill(&entries("oldest", 4)).unwrap();
        store.spill(&entries("middle", 1)).unwrap();
        store.spill(&entries("newest", 1)).unwrap();

        assert_eq!(store.prune().unwrap(), 4);
        assert_eq!(store.file_count(), 2);

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded[0].message, "middle-0");
    }

    #[test]
    fn prune_within_limit_is_noop() {
        let (store, _dir) = make_store(5);
        store.spill(&entries("a", 1)).unwrap();
        assert_eq!(store.prune().unwrap(), 0);
        assert_eq!(store.file_count(), 1);
    }
}
