//! Pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::pipeline::PipelineState;

/// Monotonic counters updated by the collection and flush loops.
#[derive(Debug, Default)]
pub struct Stats {
    collected: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    buffered_to_disk: AtomicU64,
    errors: AtomicU64,
    last_collect: RwLock<Option<DateTime<Utc>>>,
    last_send: RwLock<Option<DateTime<Utc>>>,
}

impl Stats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds to `collected`.
    pub fn add_collected(&self, n: usize) {
        self.collected.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Adds to `sent`.
    pub fn add_sent(&self, n: usize) {
        self.sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Adds to `dropped`.
    pub fn add_dropped(&self, n: usize) {
        self.dropped.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Adds to `buffered_to_disk`.
    pub fn add_buffered_to_disk(&self, n: usize) {
        self.buffered_to_disk.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Counts one error.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed collection tick.
    pub fn mark_collect(&self, at: DateTime<Utc>) {
        *self.last_collect.write() = Some(at);
    }

    /// Records a successful send.
    pub fn mark_send(&self, at: DateTime<Utc>) {
        *self.last_send.write() = Some(at);
    }

    /// Returns a read-only copy.
    #[must_use]
    pub fn snapshot(&self, buffered: usize, state: PipelineState) -> StatsSnapshot {
        StatsSnapshot {
            collected: self.collected.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            buffered_to_disk: self.buffered_to_disk.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_collect: *self.last_collect.read(),
            last_send: *self.last_send.read(),
            buffered,
            state,
        }
    }
}

/// Point-in-time view of the pipeline counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Entries produced by sources, duplicates included.
    pub collected: u64,
    /// Entries acknowledged by the collector.
    pub sent: u64,
    /// Entries lost to eviction, rejection or failed spills.
    pub dropped: u64,
    /// Entries written to the spill directory.
    pub buffered_to_disk: u64,
    /// Source, transport and spill failures.
    pub errors: u64,
    /// End of the last collection tick.
    pub last_collect: Option<DateTime<Utc>>,
    /// Time of the last successful send.
    pub last_send: Option<DateTime<Utc>>,
    /// Entries currently held in memory.
    pub buffered: usize,
    /// Lifecycle state.
    pub state: PipelineState,
}
