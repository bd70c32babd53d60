//! Test fixtures and queue helpers.
//!
//! Provides temporary queues that clean up after themselves and shortcuts
//! for committed push and pop transactions.

use bytes::Bytes;
use fpq_core::{Config, PersistentQueue};
use fpq_storage::BackendFactory;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// How long helpers wait for background work (reloads, deletions).
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// A queue in a temporary directory that is removed on drop.
pub struct TestQueue {
    /// The queue instance.
    pub queue: PersistentQueue,
    // declared after `queue` so the queue shuts down before the directory goes
    temp_dir: TempDir,
}

impl TestQueue {
    /// Opens a queue with the default configuration.
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// Opens a queue with [`small_config`].
    pub fn small() -> Self {
        Self::with_config(|config| small_config(&config.journal_directory))
    }

    /// Opens a queue with a configuration derived from the defaults.
    ///
    /// The closure receives a config already pointing at the temporary
    /// directory.
    pub fn with_config(build: impl FnOnce(Config) -> Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = build(Config::new(temp_dir.path()));
        let queue = PersistentQueue::open(config).expect("Failed to open queue");
        Self { queue, temp_dir }
    }

    /// Opens a queue whose journal files come from `backends`.
    pub fn with_backends(
        build: impl FnOnce(Config) -> Config,
        backends: Arc<dyn BackendFactory>,
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = build(Config::new(temp_dir.path()));
        let queue =
            PersistentQueue::open_with_backends(config, backends).expect("Failed to open queue");
        Self { queue, temp_dir }
    }

    /// Shuts the queue down and opens the same directory again.
    pub fn reopen(self) -> Self {
        self.reopen_with(|config| config)
    }

    /// Shuts the queue down, lets `between` touch the directory, and opens it
    /// again with the same configuration.
    pub fn reopen_after(self, between: impl FnOnce(&Path)) -> Self {
        let Self { queue, temp_dir } = self;
        let config = queue.config().clone();
        queue.shutdown().expect("Failed to shut queue down");
        drop(queue);

        between(temp_dir.path());
        let queue = PersistentQueue::open(config).expect("Failed to reopen queue");
        Self { queue, temp_dir }
    }

    /// Shuts the queue down and reopens it with an adjusted configuration.
    pub fn reopen_with(self, adjust: impl FnOnce(Config) -> Config) -> Self {
        let Self { queue, temp_dir } = self;
        let config = adjust(queue.config().clone());
        queue.shutdown().expect("Failed to shut queue down");
        drop(queue);

        let queue = PersistentQueue::open(config).expect("Failed to reopen queue");
        Self { queue, temp_dir }
    }

    /// Splits the fixture into a shareable queue and the directory guard.
    /// Keep the guard alive until every clone of the queue is dropped.
    pub fn into_shared(self) -> (Arc<PersistentQueue>, TempDir) {
        let Self { queue, temp_dir } = self;
        (Arc::new(queue), temp_dir)
    }

    /// Returns the journal directory.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }
}

impl Default for TestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestQueue {
    type Target = PersistentQueue;

    fn deref(&self) -> &Self::Target {
        &self.queue
    }
}

/// A configuration with tiny files and segments, so rolling, eviction and
/// deletion happen after a handful of entries.
pub fn small_config(dir: &Path) -> Config {
    Config::new(dir)
        .max_transaction_size(100)
        .number_of_flush_workers(2)
        .flush_period_ms(10)
        .max_journal_file_size_bytes(1024)
        .max_segment_size_bytes(512)
        .max_number_of_segments(4)
        .memory_queue_max_size(100)
}

/// Pushes `events` in one committed transaction.
pub fn push_committed<I>(queue: &PersistentQueue, events: I)
where
    I: IntoIterator,
    I::Item: Into<Bytes>,
{
    let mut ctx = queue.create_context();
    queue.push(&mut ctx, events).expect("Failed to push");
    queue.commit(&mut ctx).expect("Failed to commit push");
}

/// Pushes `events` in committed transactions of at most `batch` entries.
pub fn push_in_batches(queue: &PersistentQueue, events: &[Bytes], batch: usize) {
    for chunk in events.chunks(batch) {
        push_committed(queue, chunk.iter().cloned());
    }
}

/// Pops and commits at most `batch` entries, returning their payloads.
pub fn pop_committed(queue: &PersistentQueue, batch: usize) -> Vec<Bytes> {
    let mut ctx = queue.create_context();
    let payloads = queue
        .pop(&mut ctx, batch)
        .expect("Failed to pop")
        .iter()
        .map(|e| e.payload().clone())
        .collect();
    queue.commit(&mut ctx).expect("Failed to commit pop");
    payloads
}

/// Pops and commits until the queue is empty, waiting out segment reloads.
pub fn drain_committed(queue: &PersistentQueue, batch: usize) -> Vec<Bytes> {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    let mut out = Vec::new();
    while !queue.is_empty() && Instant::now() < deadline {
        let popped = pop_committed(queue, batch);
        if popped.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        out.extend(popped);
    }
    out
}

/// Waits until `condition` holds or [`SETTLE_TIMEOUT`] passes. Returns
/// whether it held.
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Numbered payloads `"{prefix}-00000"`, `"{prefix}-00001"`, ...
pub fn numbered_payloads(prefix: &str, count: usize) -> Vec<Bytes> {
    (0..count)
        .map(|i| Bytes::from(format!("{prefix}-{i:05}")))
        .collect()
}

/// Runs a test with a temporary queue.
pub fn with_temp_queue<F, R>(f: F) -> R
where
    F: FnOnce(&PersistentQueue) -> R,
{
    let queue = TestQueue::new();
    f(&queue)
}
