//! The segmented in-memory queue.

use crate::config::Config;
use crate::dir::QueueDir;
use crate::error::{QueueError, QueueResult};
use crate::memory::descriptor::{SegmentDescriptor, SegmentSnapshot, SegmentStatus};
use crate::memory::segment::entry_footprint;
use crate::memory::spill::SpillStore;
use crate::stats::QueueStats;
use crate::types::{Entry, SegmentId};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Entries dequeued from one segment by a single pop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoppedBatch {
    /// Segment the entries came from.
    pub segment: SegmentId,
    /// The entries, oldest first.
    pub entries: Vec<Entry>,
}

struct MemoryShared {
    segment_max_bytes: u64,
    max_resident_segments: usize,
    max_resident_entries: u64,
    segments: RwLock<Vec<Arc<SegmentDescriptor>>>,
    size: AtomicU64,
    /// Serializes everything that changes which segments are resident.
    balance: Mutex<()>,
    spill: SpillStore,
    stats: Arc<QueueStats>,
    closed: AtomicBool,
}

impl MemoryShared {
    /// Resident segment count and resident entry count.
    fn resident_load(&self) -> (usize, u64) {
        let segments = self.segments.read();
        let count = segments
            .iter()
            .filter(|d| d.status().is_resident())
            .count();
        let entries = segments.iter().map(|d| d.segment().resident_len()).sum();
        (count, entries)
    }

    /// Evicts until both resident budgets hold, counting `incoming` entries
    /// that are about to become resident. Caller holds `balance`.
    fn rebalance(&self, incoming: u64) {
        loop {
            let (segments, entries) = self.resident_load();
            if segments <= self.max_resident_segments
                && entries.saturating_add(incoming) <= self.max_resident_entries
            {
                return;
            }
            if !self.evict_one() {
                return;
            }
        }
    }

    /// Offloads the newest ready segment other than the push target.
    /// Returns false when nothing more can be evicted.
    fn evict_one(&self) -> bool {
        let candidate = {
            let segments = self.segments.read();
            let before_target = segments.len().saturating_sub(1);
            segments[..before_target]
                .iter()
                .rev()
                .find(|d| d.status() == SegmentStatus::Ready && d.segment().available() > 0)
                .cloned()
        };
        let Some(desc) = candidate else {
            return false;
        };
        if desc.transition(SegmentStatus::Saving).is_err() {
            return false;
        }

        let tail = desc.segment().spill_out();
        if tail.is_empty() {
            // a pop reserved everything before the status changed
            return desc.transition(SegmentStatus::Ready).is_ok();
        }

        let count = tail.len();
        match self.spill.save(desc.id(), &tail) {
            Ok(handle) => {
                desc.set_spill(handle);
                if let Err(e) = desc.transition(SegmentStatus::Offline) {
                    error!(segment = %desc.id(), error = %e, "segment eviction left inconsistent status");
                    return false;
                }
                desc.reload().succeeded();
                self.stats.record_segment_evicted();
                debug!(segment = %desc.id(), entries = count, "segment offloaded");
                true
            }
            Err(e) => {
                desc.segment().restore(tail);
                let _ = desc.transition(SegmentStatus::Ready);
                warn!(segment = %desc.id(), error = %e, "segment offload failed, keeping it resident");
                false
            }
        }
    }

    /// Brings an offline segment back into memory.
    fn reload(&self, desc: &SegmentDescriptor) {
        {
            let _balance = self.balance.lock();
            if desc.transition(SegmentStatus::Loading).is_err() {
                desc.reload().release();
                return;
            }
            self.rebalance(desc.spilled_entries());
        }

        let Some(handle) = desc.take_spill() else {
            let _ = desc.transition(SegmentStatus::Ready);
            desc.reload().succeeded();
            return;
        };

        match self.spill.load(&handle) {
            Ok(entries) => {
                let count = entries.len();
                desc.segment().restore(entries);
                let _ = desc.transition(SegmentStatus::Ready);
                self.spill.discard(handle);
                desc.reload().succeeded();
                self.stats.record_segment_reload(true);
                debug!(segment = %desc.id(), entries = count, "segment reloaded");
            }
            Err(e) => {
                desc.set_spill(handle);
                let _ = desc.transition(SegmentStatus::Offline);
                desc.reload().failed();
                self.stats.record_segment_reload(false);
                warn!(
                    segment = %desc.id(),
                    error = %e,
                    retry_in = ?desc.reload().backoff(),
                    "segment reload failed"
                );
            }
        }
    }

    /// Unlinks closed segments with nothing left in them.
    fn remove_drained(&self) {
        let mut segments = self.segments.write();
        let before = segments.len();
        segments.retain(|d| !(d.status() == SegmentStatus::Ready && d.segment().is_drained()));
        let removed = before - segments.len();
        if removed > 0 {
            debug!(removed, remaining = segments.len(), "drained segments removed");
        }
    }
}

/// Ordered segments, oldest first, fronting the journal for reads.
///
/// Pushes go to the newest segment; when it refuses a batch it is closed
/// and a new one is appended. While more segments are resident than
/// allowed, or more entries than `memory_queue_max_size`, the newest ready
/// segment other than the push target is written to a spill file. Pops
/// scan oldest first, skip segments that are not ready, and ask the loader
/// thread to bring offline ones back.
///
/// Ordering is strict FIFO while every segment holding entries is
/// resident. A pop that finds an older segment offline takes from the next
/// ready one instead of waiting for the reload.
pub struct MemoryQueue {
    shared: Arc<MemoryShared>,
    loader_tx: Mutex<Option<Sender<Arc<SegmentDescriptor>>>>,
    loader: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryQueue {
    /// Creates an empty queue and starts its loader thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the loader thread cannot be started.
    pub fn new(dir: Arc<QueueDir>, config: &Config, stats: Arc<QueueStats>) -> QueueResult<Self> {
        let shared = Arc::new(MemoryShared {
            segment_max_bytes: config.max_segment_size_bytes,
            max_resident_segments: usize::try_from(config.max_number_of_segments)
                .unwrap_or(usize::MAX),
            max_resident_entries: config.memory_queue_max_size,
            segments: RwLock::new(Vec::new()),
            size: AtomicU64::new(0),
            balance: Mutex::new(()),
            spill: SpillStore::new(dir),
            stats,
            closed: AtomicBool::new(false),
        });

        let (tx, rx) = mpsc::channel();
        let loader = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("fpq-segment-loader".into())
                .spawn(move || run_loader(&shared, rx))?
        };

        Ok(Self {
            shared,
            loader_tx: Mutex::new(Some(tx)),
            loader: Mutex::new(Some(loader)),
        })
    }

    /// Publishes a committed batch.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidState`] if the batch is larger than an
    /// empty segment can hold, or [`QueueError::Closed`] after shutdown.
    pub fn push(&self, entries: Vec<Entry>) -> QueueResult<()> {
        self.ensure_open()?;
        if entries.is_empty() {
            return Ok(());
        }
        let bytes: u64 = entries.iter().map(entry_footprint).sum();
        if bytes > self.shared.segment_max_bytes {
            return Err(QueueError::invalid_state(format!(
                "batch of {bytes} bytes cannot fit a {} byte segment",
                self.shared.segment_max_bytes
            )));
        }

        let _balance = self.shared.balance.lock();
        self.shared
            .size
            .fetch_add(entries.len() as u64, Ordering::AcqRel);

        let mut pending = entries;
        loop {
            let target = self.shared.segments.read().last().cloned();
            if let Some(target) = target {
                match target.segment().try_push(pending) {
                    Ok(()) => break,
                    Err(refused) => {
                        pending = refused;
                        target.segment().close_for_push();
                    }
                }
            }

            let fresh = Arc::new(SegmentDescriptor::new(self.shared.segment_max_bytes));
            debug!(segment = %fresh.id(), "segment created");
            self.shared.segments.write().push(fresh);
            self.shared.stats.record_segment_created();
        }

        self.shared.rebalance(0);
        Ok(())
    }

    /// Reserves and dequeues up to `max` entries from the oldest ready
    /// segment that has any. Never blocks on I/O.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] after shutdown.
    pub fn pop(&self, max: usize) -> QueueResult<Option<PoppedBatch>> {
        self.ensure_open()?;
        if max == 0 {
            return Ok(None);
        }

        let mut due = Vec::new();
        let mut saw_drained = false;
        let reserved = {
            let segments = self.shared.segments.read();
            let mut reserved = None;
            for desc in segments.iter() {
                if desc.status() == SegmentStatus::Offline {
                    if desc.reload().try_claim() {
                        due.push(Arc::clone(desc));
                    }
                    continue;
                }
                let count = desc.try_reserve(max as u64);
                if count > 0 {
                    reserved = Some((Arc::clone(desc), count));
                    break;
                }
                saw_drained |= desc.segment().is_drained();
            }
            reserved
        };

        for desc in due {
            self.request_reload(desc);
        }

        let Some((desc, count)) = reserved else {
            if saw_drained {
                self.shared.remove_drained();
            }
            return Ok(None);
        };

        let entries = desc.segment().take(count);
        self.shared
            .size
            .fetch_sub(entries.len() as u64, Ordering::AcqRel);
        if saw_drained || desc.segment().is_drained() {
            self.shared.remove_drained();
        }

        Ok(Some(PoppedBatch {
            segment: desc.id(),
            entries,
        }))
    }

    /// Returns a popped batch to the front of its segment.
    ///
    /// If the segment has been unlinked meanwhile, a new closed segment is
    /// inserted before the first segment holding newer entries.
    pub fn unpop(&self, batch: PoppedBatch) {
        let Some(first) = batch.entries.first().map(Entry::sequence_id) else {
            return;
        };
        let count = batch.entries.len() as u64;

        {
            let segments = self.shared.segments.read();
            if let Some(desc) = segments.iter().find(|d| d.id() == batch.segment) {
                desc.segment().unpop(batch.entries);
                self.shared.size.fetch_add(count, Ordering::AcqRel);
                return;
            }
        }

        let _balance = self.shared.balance.lock();
        let fresh = Arc::new(SegmentDescriptor::new(self.shared.segment_max_bytes));
        fresh.segment().close_for_push();
        fresh.segment().unpop(batch.entries);
        {
            let mut segments = self.shared.segments.write();
            let position = segments
                .iter()
                .position(|d| d.segment().first_sequence().is_none_or(|s| s > first))
                .unwrap_or(segments.len());
            if position == segments.len() {
                if let Some(last) = segments.last() {
                    last.segment().close_for_push();
                }
            }
            debug!(segment = %fresh.id(), position, entries = count, "segment recreated for rollback");
            segments.insert(position, fresh);
        }
        self.shared.size.fetch_add(count, Ordering::AcqRel);
        self.shared.stats.record_segment_created();
        self.shared.rebalance(0);
    }

    fn request_reload(&self, desc: Arc<SegmentDescriptor>) {
        match self.loader_tx.lock().as_ref() {
            Some(tx) => {
                if let Err(mpsc::SendError(desc)) = tx.send(desc) {
                    desc.reload().release();
                }
            }
            None => desc.reload().release(),
        }
    }

    /// Entries published and not yet dequeued.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.shared.size.load(Ordering::Acquire)
    }

    /// True when nothing is waiting to be popped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Segments that are not offloaded.
    #[must_use]
    pub fn resident_segments(&self) -> usize {
        self.shared.resident_load().0
    }

    /// Entries held in memory.
    #[must_use]
    pub fn resident_entries(&self) -> u64 {
        self.shared.resident_load().1
    }

    /// Describes every segment, oldest first.
    #[must_use]
    pub fn segments(&self) -> Vec<SegmentSnapshot> {
        self.shared
            .segments
            .read()
            .iter()
            .map(|d| d.snapshot())
            .collect()
    }

    /// Stops the loader and removes spill files. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(self.loader_tx.lock().take());
        if let Some(handle) = self.loader.lock().take() {
            if handle.join().is_err() {
                error!("segment loader panicked");
            }
        }
        for desc in self.shared.segments.read().iter() {
            if let Some(handle) = desc.take_spill() {
                self.shared.spill.discard(handle);
            }
        }
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryQueue")
            .field("size", &self.size())
            .field("segments", &self.shared.segments.read().len())
            .finish_non_exhaustive()
    }
}

impl Drop for MemoryQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loader(shared: &MemoryShared, rx: Receiver<Arc<SegmentDescriptor>>) {
    for desc in rx {
        if shared.closed.load(Ordering::Acquire) {
            desc.reload().release();
            continue;
        }
        shared.reload(&desc);
    }
}
