//! Bounded in-memory entry queue.
//!
//! When an insert would exceed capacity, the oldest tenth of the capacity
//! (at least one entry) is evicted first. Callers add the returned eviction
//! count to the `dropped` counter.

use std::collections::VecDeque;

use tracing::warn;

use crate::types::LogEntry;

/// Ordered, bounded queue of entries awaiting export.
#[derive(Debug)]
pub struct EntryBuffer {
    entries: VecDeque<LogEntry>,
    max_entries: usize,
}

impl EntryBuffer {
    /// Creates a buffer holding at most `max_entries` entries.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Appends entries at the back, returning how many were evicted.
    pub fn append(&mut self, entries: Vec<LogEntry>) -> usize {
        let mut evicted = 0;
        for entry in entries {
            evicted += self.make_room();
            self.entries.push_back(entry);
        }
        evicted
    }

    /// Puts entries back at the front, keeping their order.
    ///
    /// Returns how many entries were evicted to respect the bound; eviction
    /// still takes the oldest entries, which are now the requeued ones.
    pub fn requeue(&mut self, entries: Vec<LogEntry>) -> usize {
        for entry in entries.into_iter().rev() {
            self.entries.push_front(entry);
        }
        let mut evicted = 0;
        while self.entries.len() > self.max_entries {
            let over = self.entries.len() - self.max_entries;
            evicted += self.evict(over.max(self.eviction_chunk()));
        }
        evicted
    }

    /// Takes every buffered entry, leaving the buffer empty.
    pub fn drain_all(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.entries).into()
    }

    /// Returns the number of buffered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the capacity.
    #[must_use]
    pub const fn max_entries(&self) -> usize {
        self.max_entries
    }

    fn eviction_chunk(&self) -> usize {
        (self.max_entries / 10).max(1)
    }

    fn make_room(&mut self) -> usize {
        if self.entries.len() < self.max_entries {
            return 0;
        }
        self.evict(self.eviction_chunk())
    }

    fn evict(&mut self, count: usize) -> usize {
        let count = count.min(self.entries.len());
        self.entries.drain(..count);
        warn!(
            evicted = count,
            capacity = self.max_entries,
            "buffer full, evicted oldest entries"
        );
        count
    }
}
