//! Queue statistics.
//!
//! Counters are shared by the journal manager, the memory queue and the
//! facade through one `Arc<QueueStats>`. All counters are monotonic.
//!
//! ```rust,ignore
//! let snapshot = queue.stats();
//! println!("journals created: {}", snapshot.journals_created);
//! println!("segments evicted: {}", snapshot.segments_evicted);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Live queue counters.
#[derive(Debug, Default)]
pub struct QueueStats {
    // Journal
    journals_created: AtomicU64,
    journals_removed: AtomicU64,
    bytes_journaled: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    recovered_entries: AtomicU64,

    // Transactions
    entries_pushed: AtomicU64,
    entries_popped: AtomicU64,
    push_commits: AtomicU64,
    pop_commits: AtomicU64,
    rollbacks: AtomicU64,

    // Memory queue
    segments_created: AtomicU64,
    segments_evicted: AtomicU64,
    segments_reloaded: AtomicU64,
    reload_failures: AtomicU64,
}

impl QueueStats {
    /// Creates a zeroed stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_journal_created(&self) {
        self.journals_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_journal_removed(&self) {
        self.journals_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_journaled_bytes(&self, bytes: u64) {
        self.bytes_journaled.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, ok: bool) {
        if ok {
            self.flushes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.flush_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_recovered(&self, entries: u64) {
        self.recovered_entries.fetch_add(entries, Ordering::Relaxed);
    }

    pub(crate) fn record_push_commit(&self, entries: u64) {
        self.push_commits.fetch_add(1, Ordering::Relaxed);
        self.entries_pushed.fetch_add(entries, Ordering::Relaxed);
    }

    pub(crate) fn record_pop_commit(&self, entries: u64) {
        self.pop_commits.fetch_add(1, Ordering::Relaxed);
        self.entries_popped.fetch_add(entries, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segment_created(&self) {
        self.segments_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segment_evicted(&self) {
        self.segments_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segment_reload(&self, ok: bool) {
        if ok {
            self.segments_reloaded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reload_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns the number of journal files created, including the first one.
    pub fn journals_created(&self) -> u64 {
        self.journals_created.load(Ordering::Relaxed)
    }

    /// Returns the number of drained journal files deleted.
    pub fn journals_removed(&self) -> u64 {
        self.journals_removed.load(Ordering::Relaxed)
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        QueueStatsSnapshot {
            journals_created: load(&self.journals_created),
            journals_removed: load(&self.journals_removed),
            bytes_journaled: load(&self.bytes_journaled),
            flushes: load(&self.flushes),
            flush_failures: load(&self.flush_failures),
            recovered_entries: load(&self.recovered_entries),
            entries_pushed: load(&self.entries_pushed),
            entries_popped: load(&self.entries_popped),
            push_commits: load(&self.push_commits),
            pop_commits: load(&self.pop_commits),
            rollbacks: load(&self.rollbacks),
            segments_created: load(&self.segments_created),
            segments_evicted: load(&self.segments_evicted),
            segments_reloaded: load(&self.segments_reloaded),
            reload_failures: load(&self.reload_failures),
        }
    }
}

/// A point-in-time copy of [`QueueStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueStatsSnapshot {
    /// Journal files created.
    pub journals_created: u64,
    /// Journal files deleted after being drained.
    pub journals_removed: u64,
    /// Record bytes appended to journal files.
    pub bytes_journaled: u64,
    /// Successful fsync calls on journal files.
    pub flushes: u64,
    /// Failed fsync calls on journal files.
    pub flush_failures: u64,
    /// Entries replayed from the journal at open.
    pub recovered_entries: u64,
    /// Entries made visible by push commits.
    pub entries_pushed: u64,
    /// Entries consumed by pop commits.
    pub entries_popped: u64,
    /// Successful push commits.
    pub push_commits: u64,
    /// Successful pop commits.
    pub pop_commits: u64,
    /// Rolled back transactions, explicit or after a failed pop commit.
    pub rollbacks: u64,
    /// Memory segments created.
    pub segments_created: u64,
    /// Memory segments offloaded to disk.
    pub segments_evicted: u64,
    /// Memory segments reloaded from disk.
    pub segments_reloaded: u64,
    /// Failed reload attempts (retried with backoff).
    pub reload_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        assert_eq!(QueueStats::new().snapshot(), QueueStatsSnapshot::default());
    }

    #[test]
    fn commits_count_entries() {
        let stats = QueueStats::new();
        stats.record_push_commit(10);
        stats.record_push_commit(5);
        stats.record_pop_commit(7);

        let snap = stats.snapshot();
        assert_eq!(snap.push_commits, 2);
        assert_eq!(snap.entries_pushed, 15);
        assert_eq!(snap.pop_commits, 1);
        assert_eq!(snap.entries_popped, 7);
    }

    #[test]
    fn flush_and_reload_outcomes_are_split() {
        let stats = QueueStats::new();
        stats.record_flush(true);
        stats.record_flush(false);
        stats.record_segment_reload(false);
        stats.record_segment_reload(true);

        let snap = stats.snapshot();
        assert_eq!((snap.flushes, snap.flush_failures), (1, 1));
        assert_eq!((snap.segments_reloaded, snap.reload_failures), (1, 1));
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(QueueStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        s.record_journal_created();
                        s.record_journal_removed();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.journals_created(), 800);
        assert_eq!(stats.journals_removed(), 800);
    }
}
