//! The persistent queue facade.

use crate::config::Config;
use crate::context::{ContextMode, TransactionContext};
use crate::dir::QueueDir;
use crate::error::{QueueError, QueueResult};
use crate::journal::{JournalFileDescriptor, JournalManager};
use crate::memory::{batch_footprint, entry_footprint, MemoryQueue, SegmentSnapshot};
use crate::stats::{QueueStats, QueueStatsSnapshot};
use crate::types::Entry;
use bytes::Bytes;
use fpq_storage::{BackendFactory, FileBackendFactory};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// A disk-durable transactional FIFO queue.
///
/// Producers accumulate payloads in a [`TransactionContext`] and commit
/// them; a commit writes them to the journal first and only then makes them
/// visible to consumers. Consumers pop into a context and commit to
/// acknowledge consumption, or roll back to put the entries back at the
/// front of the queue.
///
/// ```rust,no_run
/// use fpq_core::{Config, PersistentQueue};
///
/// let queue = PersistentQueue::open(Config::new("/var/lib/fpq/events"))?;
///
/// let mut ctx = queue.create_context();
/// queue.push(&mut ctx, ["first", "second"])?;
/// queue.commit(&mut ctx)?;
///
/// let popped = queue.pop(&mut ctx, 10)?;
/// assert_eq!(popped.len(), 2);
/// queue.commit(&mut ctx)?;
/// # Ok::<(), fpq_core::QueueError>(())
/// ```
pub struct PersistentQueue {
    config: Config,
    dir: Arc<QueueDir>,
    journal: JournalManager,
    memory: MemoryQueue,
    stats: Arc<QueueStats>,
    /// Keeps journal order and memory order identical.
    commit_lock: Mutex<()>,
    closed: AtomicBool,
}

impl PersistentQueue {
    /// Opens the queue stored in `config.journal_directory`.
    ///
    /// Takes the directory lock, recovers the journal and replays every
    /// unconsumed entry into memory before returning.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Configuration`] for an invalid config, or a
    ///   recovered entry too large for `max_segment_size_bytes`
    /// - [`QueueError::QueueLocked`] if another process owns the directory
    /// - a storage error if the directory cannot be read or written
    pub fn open(config: Config) -> QueueResult<Self> {
        Self::open_with_backends(config, Arc::new(FileBackendFactory))
    }

    /// Opens the queue with journal files served by `backends`.
    ///
    /// This is a lower-level constructor for wrapping the journal's storage;
    /// for most use cases, prefer [`Self::open`].
    ///
    /// # Errors
    ///
    /// As [`Self::open`].
    pub fn open_with_backends(
        config: Config,
        backends: Arc<dyn BackendFactory>,
    ) -> QueueResult<Self> {
        config.validate()?;

        let dir = Arc::new(QueueDir::open(&config.journal_directory)?);
        dir.reset_segments()?;
        let orphans = dir.remove_orphan_acks()?;
        if orphans > 0 {
            debug!(orphans, "removed ack files of deleted journals");
        }

        let stats = Arc::new(QueueStats::new());
        let (journal, recovered) = JournalManager::open(
            Arc::clone(&dir),
            &config,
            Arc::clone(&stats),
            backends,
        )?;
        let memory = MemoryQueue::new(Arc::clone(&dir), &config, Arc::clone(&stats))?;
        let replayed = recovered.len();
        replay(&memory, recovered, config.max_segment_size_bytes)?;

        info!(
            dir = %config.journal_directory.display(),
            replayed,
            "queue opened"
        );
        Ok(Self {
            config,
            dir,
            journal,
            memory,
            stats,
            commit_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Creates an idle context sized to `max_transaction_size`.
    #[must_use]
    pub fn create_context(&self) -> TransactionContext {
        TransactionContext::new(self.config.max_transaction_size as usize)
    }

    /// Adds events to a push transaction. Nothing is written until
    /// [`Self::commit`].
    ///
    /// # Errors
    ///
    /// - [`QueueError::TransactionSizeExceeded`] if the context would exceed
    ///   its capacity; the context is unchanged
    /// - [`QueueError::InvalidState`] if the context holds popped entries
    pub fn push<I>(&self, ctx: &mut TransactionContext, events: I) -> QueueResult<()>
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        self.ensure_open()?;
        ctx.push_into(events.into_iter().map(Into::into).collect())
    }

    /// Adds one event to a push transaction.
    ///
    /// # Errors
    ///
    /// As [`Self::push`].
    pub fn push_one(&self, ctx: &mut TransactionContext, event: impl Into<Bytes>) -> QueueResult<()> {
        self.push(ctx, [event.into()])
    }

    /// Pops up to `size` entries into `ctx` and returns everything the
    /// context now holds.
    ///
    /// Never blocks: a short or empty result only means nothing more was
    /// ready. Calling again tops up the same transaction.
    ///
    /// # Errors
    ///
    /// - [`QueueError::TransactionSizeExceeded`] if `size`, or the context's
    ///   current length plus `size`, exceeds its capacity
    /// - [`QueueError::InvalidState`] if the context holds pending pushes
    pub fn pop<'c>(
        &self,
        ctx: &'c mut TransactionContext,
        size: usize,
    ) -> QueueResult<&'c [Entry]> {
        self.ensure_open()?;
        ctx.check_pop(size)?;

        if let Some(batch) = self.memory.pop(size)? {
            if let Err(batch) = ctx.adopt_popped(batch) {
                self.memory.unpop(batch);
                return Err(QueueError::invalid_state("popped batch does not fit its context"));
            }
        }
        Ok(ctx.entries())
    }

    /// Completes the transaction held by `ctx`.
    ///
    /// A push commit journals the payloads, then publishes them to
    /// consumers. A pop commit acknowledges the entries to the journal. On
    /// success the context is reset; an idle context commits as a no-op.
    ///
    /// # Errors
    ///
    /// - [`QueueError::BatchTooLarge`] if the pushed payloads cannot fit one
    ///   segment; the context is unchanged
    /// - a storage error if the journal write fails. A push context keeps
    ///   its payloads and can be committed again. A pop context is rolled
    ///   back: its entries return to the front of the queue.
    pub fn commit(&self, ctx: &mut TransactionContext) -> QueueResult<()> {
        match ctx.mode() {
            ContextMode::Idle => Ok(()),
            ContextMode::Pushing => self.commit_push(ctx),
            ContextMode::Popping => self.commit_pop(ctx),
        }
    }

    fn commit_push(&self, ctx: &mut TransactionContext) -> QueueResult<()> {
        self.ensure_open()?;
        let bytes = batch_footprint(ctx.pending());
        if bytes > self.config.max_segment_size_bytes {
            return Err(QueueError::batch_too_large(
                bytes,
                self.config.max_segment_size_bytes,
            ));
        }

        let count = ctx.len() as u64;
        let published = {
            let _commit = self.commit_lock.lock();
            let entries = self.journal.append(ctx.pending())?;
            self.memory.push(entries)
        };
        // the entries are durable either way; a failed publish is replayed
        // at the next open
        ctx.reset();
        published?;

        self.stats.record_push_commit(count);
        Ok(())
    }

    fn commit_pop(&self, ctx: &mut TransactionContext) -> QueueResult<()> {
        if let Err(e) = self.journal.report_consumed(ctx.entries()) {
            self.restore_popped(ctx);
            return Err(e);
        }
        self.stats.record_pop_commit(ctx.len() as u64);
        ctx.reset();
        Ok(())
    }

    /// Abandons the transaction held by `ctx`.
    ///
    /// Pending pushes are discarded. Popped entries go back to the front of
    /// the queue in their original order.
    pub fn rollback(&self, ctx: &mut TransactionContext) {
        match ctx.mode() {
            ContextMode::Idle => return,
            ContextMode::Pushing => ctx.reset(),
            ContextMode::Popping => self.restore_popped(ctx),
        }
        self.stats.record_rollback();
    }

    fn restore_popped(&self, ctx: &mut TransactionContext) {
        for batch in ctx.take_popped().into_iter().rev() {
            self.memory.unpop(batch);
        }
    }

    /// Entries published and not yet popped.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.memory.size()
    }

    /// True when nothing is waiting to be popped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Fsyncs every dirty journal file now instead of on the next flush
    /// tick.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] after shutdown or the first sync
    /// failure.
    pub fn flush(&self) -> QueueResult<()> {
        self.ensure_open()?;
        self.journal.flush()
    }

    /// Returns a snapshot of the queue counters.
    #[must_use]
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    /// Journal files created by this process, including the one created at
    /// open.
    #[must_use]
    pub fn journals_created(&self) -> u64 {
        self.stats.journals_created()
    }

    /// Drained journal files deleted by this process.
    #[must_use]
    pub fn journals_removed(&self) -> u64 {
        self.stats.journals_removed()
    }

    /// Describes the live journal files, oldest first.
    #[must_use]
    pub fn journal_files(&self) -> Vec<JournalFileDescriptor> {
        self.journal.files()
    }

    /// Describes the journal file receiving appends.
    #[must_use]
    pub fn current_journal(&self) -> JournalFileDescriptor {
        self.journal.current_file()
    }

    /// Describes the memory segments, oldest first.
    #[must_use]
    pub fn segments(&self) -> Vec<SegmentSnapshot> {
        self.memory.segments()
    }

    /// Returns the configuration the queue was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the journal directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Stops the segment loader, then flushes and stops the journal.
    /// Idempotent; later operations fail with [`QueueError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns the first failure of the final journal flush.
    pub fn shutdown(&self) -> QueueResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.memory.shutdown();
        let result = self.journal.shutdown();
        info!(
            dir = %self.dir.path().display(),
            unconsumed = self.memory.size(),
            "queue shut down"
        );
        result
    }

    /// True once [`Self::shutdown`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.is_closed() {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Publishes recovered entries in chunks that each fit one segment.
fn replay(memory: &MemoryQueue, entries: Vec<Entry>, segment_max: u64) -> QueueResult<()> {
    let mut chunk = Vec::new();
    let mut chunk_bytes = 0;
    for entry in entries {
        let bytes = entry_footprint(&entry);
        if bytes > segment_max {
            return Err(QueueError::configuration(format!(
                "recovered entry {} needs {bytes} bytes but max_segment_size_bytes is {segment_max}",
                entry.sequence_id()
            )));
        }
        if chunk_bytes + bytes > segment_max {
            memory.push(std::mem::take(&mut chunk))?;
            chunk_bytes = 0;
        }
        chunk_bytes += bytes;
        chunk.push(entry);
    }
    memory.push(chunk)
}

impl std::fmt::Debug for PersistentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentQueue")
            .field("path", &self.dir.path())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for PersistentQueue {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
