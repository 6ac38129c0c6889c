//! Time-windowed duplicate suppression.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::types::LogEntry;

/// Table size above which old hashes are swept.
pub const DEFAULT_SWEEP_THRESHOLD: usize = 10_000;

/// Collapses identical entries seen within a window.
///
/// Owned by the collection loop alone; it is never shared, so it carries
/// no lock. Once the table is over the sweep threshold it is swept at most
/// once per window.
#[derive(Debug)]
pub struct Deduplicator {
    seen: HashMap<String, Instant>,
    window: Duration,
    horizon: Duration,
    sweep_threshold: usize,
    last_sweep: Option<Instant>,
    sweeps: u64,
}

impl Deduplicator {
    /// Creates a deduplicator.
    #[must_use]
    pub fn new(window: Duration, horizon: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            window,
            horizon: horizon.max(window),
            sweep_threshold: DEFAULT_SWEEP_THRESHOLD,
            last_sweep: None,
            sweeps: 0,
        }
    }

    /// Overrides the sweep threshold.
    #[must_use]
    pub const fn with_sweep_threshold(mut self, threshold: usize) -> Self {
        self.sweep_threshold = threshold;
        self
    }

    /// Returns true if the entry should be kept.
    pub fn accept(&mut self, entry: &LogEntry) -> bool {
        self.accept_at(entry, Instant::now())
    }

    /// Same as [`Self::accept`] with an explicit clock reading.
    ///
    /// A rejected duplicate does not refresh the stored time, so a message
    /// repeated forever is still let through once per window.
    pub fn accept_at(&mut self, entry: &LogEntry, now: Instant) -> bool {
        if let Some(seen_at) = self.seen.get(&entry.content_hash) {
            if now.saturating_duration_since(*seen_at) < self.window {
                return false;
            }
        }

        self.seen.insert(entry.content_hash.clone(), now);
        if self.seen.len() > self.sweep_threshold && self.sweep_due(now) {
            self.sweep(now);
        }
        true
    }

    /// Purges hashes older than the horizon.
    pub fn sweep(&mut self, now: Instant) {
        let before = self.seen.len();
        let horizon = self.horizon;
        self.seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < horizon);
        self.last_sweep = Some(now);
        self.sweeps += 1;
        debug!(before, after = self.seen.len(), sweeps = self.sweeps, "dedup table swept");
    }

    fn sweep_due(&self, now: Instant) -> bool {
        self.last_sweep
            .is_none_or(|last| now.saturating_duration_since(last) >= self.window)
    }

    /// Returns the number of tracked hashes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Returns true if no hashes are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Severity, SourceKind};
    use chrono::Utc;

    fn entry(message: &str) -> LogEntry {
        LogEntry::new(
            Utc::now(),
            Severity::Info,
            message,
            SourceKind::File,
            "/var/log/app.log",
            "app",
            "host",
        )
    }

    fn dedup() -> Deduplicator {
        Deduplicator::new(Duration::from_secs(10), Duration::from_secs(300))
    }

    #[test]
    fn duplicate_inside_window_is_rejected() {
        let mut d = dedup();
        let t0 = Instant::now();
        assert!(d.accept_at(&entry("hello"), t0));
        assert!(!d.accept_at(&entry("hello"), t0 + Duration::from_secs(5)));
    }

    #[test]
    fn duplicate_after_window_is_accepted() {
        let mut d = dedup();
        let t0 = Instant::now();
        assert!(d.accept_at(&entry("hello"), t0));
        assert!(d.accept_at(&entry("hello"), t0 + Duration::from_secs(11)));
    }

    #[test]
    fn rejection_does_not_extend_window() {
        let mut d = dedup();
        let t0 = Instant::now();
        assert!(d.accept_at(&entry("spam"), t0));
        assert!(!d.accept_at(&entry("spam"), t0 + Duration::from_secs(9)));
        assert!(d.accept_at(&entry("spam"), t0 + Duration::from_secs(10)));
    }

    #[test]
    fn different_content_is_independent() {
        let mut d = dedup();
        let t0 = Instant::now();
        assert!(d.accept_at(&entry("a"), t0));
        assert!(d.accept_at(&entry("b"), t0));
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn timestamp_does_not_affect_identity() {
        let mut d = dedup();
        let mut later = entry("same");
        later.timestamp += chrono::Duration::hours(1);
        assert!(d.accept(&entry("same")));
        assert!(!d.accept(&later));
    }

    #[test]
    fn sweep_purges_beyond_horizon() {
        let mut d = Deduplicator::new(Duration::from_secs(1), Duration::from_secs(60))
            .with_sweep_threshold(2);
        let t0 = Instant::now();
        d.accept_at(&entry("old-1"), t0);
        d.accept_at(&entry("old-2"), t0);
        assert_eq!(d.len(), 2);

        d.accept_at(&entry("new"), t0 + Duration::from_secs(61));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn sweeps_are_rate_limited_while_table_is_live() {
        let mut d = Deduplicator::new(Duration::from_secs(10), Duration::from_secs(300))
            .with_sweep_threshold(100);
        let t0 = Instant::now();

        for i in 0..2_000 {
            assert!(d.accept_at(&entry(&format!("burst-{i}")), t0));
        }
        assert_eq!(d.len(), 2_000);
        assert_eq!(d.sweeps, 1);

        for i in 0..2_000 {
            d.accept_at(&entry(&format!("more-{i}")), t0 + Duration::from_secs(5));
        }
        assert_eq!(d.sweeps, 1);

        d.accept_at(&entry("after-window"), t0 + Duration::from_secs(10));
        assert_eq!(d.sweeps, 2);
    }

    #[test]
    fn sweep_below_threshold_is_deferred() {
        let mut d = dedup();
        let t0 = Instant::now();
        d.accept_at(&entry("x"), t0);
        d.accept_at(&entry("y"), t0 + Duration::from_secs(3600));
        assert_eq!(d.len(), 2);
        assert!(!d.is_empty());
    }
}
