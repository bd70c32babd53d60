//! Bounded FIFO buffer of entries.

use crate::journal::encoded_len;
use crate::types::{Entry, SequenceId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Bytes an entry counts against a segment budget: its encoded record size.
#[must_use]
pub fn entry_footprint(entry: &Entry) -> u64 {
    encoded_len(entry.payload().len()) as u64
}

/// Bytes a batch of payloads counts against a segment budget.
#[must_use]
pub fn batch_footprint<T: AsRef<[u8]>>(payloads: &[T]) -> u64 {
    payloads
        .iter()
        .map(|p| encoded_len(p.as_ref().len()) as u64)
        .sum()
}

#[derive(Debug, Default)]
struct SegmentInner {
    resident: VecDeque<Entry>,
    bytes_used: u64,
    entries_pushed: u64,
    entries_popped: u64,
    spilled: u64,
    first_sequence: Option<SequenceId>,
}

/// A byte-bounded run of entries.
///
/// Pushes admit whole batches or nothing. Pops happen in two steps:
/// [`Self::reserve`] claims a count with a lock-free decrement of
/// `available`, then [`Self::take`] dequeues exactly that many from the
/// front. Entries reserved but not yet taken are always resident.
///
/// `bytes_used` only grows: a segment accepts at most `max_bytes` worth of
/// pushes over its life, then the queue moves on to a new one.
#[derive(Debug)]
pub struct Segment {
    max_bytes: u64,
    available: AtomicU64,
    closed_for_push: AtomicBool,
    inner: Mutex<SegmentInner>,
}

impl Segment {
    /// Creates an empty segment.
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            available: AtomicU64::new(0),
            closed_for_push: AtomicBool::new(false),
            inner: Mutex::new(SegmentInner::default()),
        }
    }

    /// Admits the whole batch, or hands it back if the segment is closed or
    /// the batch does not fit.
    pub fn try_push(&self, entries: Vec<Entry>) -> Result<(), Vec<Entry>> {
        let bytes: u64 = entries.iter().map(entry_footprint).sum();
        let mut inner = self.inner.lock();
        if self.is_closed_for_push() || inner.bytes_used + bytes > self.max_bytes {
            return Err(entries);
        }

        let count = entries.len() as u64;
        if let Some(first) = entries.first() {
            inner.first_sequence.get_or_insert(first.sequence_id());
        }
        inner.resident.extend(entries);
        inner.bytes_used += bytes;
        inner.entries_pushed += count;
        self.available.fetch_add(count, Ordering::AcqRel);
        Ok(())
    }

    /// Claims up to `max` available entries and returns how many were
    /// claimed.
    pub fn reserve(&self, max: u64) -> u64 {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |available| {
                (available > 0 && max > 0).then(|| available - available.min(max))
            })
            .map_or(0, |available| available.min(max))
    }

    /// Dequeues `count` previously reserved entries from the front.
    pub fn take(&self, count: u64) -> Vec<Entry> {
        let mut inner = self.inner.lock();
        let count = usize::try_from(count)
            .unwrap_or(usize::MAX)
            .min(inner.resident.len());
        let taken: Vec<Entry> = inner.resident.drain(..count).collect();
        inner.entries_popped += taken.len() as u64;
        taken
    }

    /// Puts entries back at the front, keeping their order, and makes them
    /// available again.
    pub fn unpop(&self, entries: Vec<Entry>) {
        let count = entries.len() as u64;
        let mut inner = self.inner.lock();
        if let Some(first) = entries.first() {
            let seq = first.sequence_id();
            inner.first_sequence = Some(inner.first_sequence.map_or(seq, |s| s.min(seq)));
        }
        for entry in entries.into_iter().rev() {
            inner.resident.push_front(entry);
        }
        inner.entries_popped = inner.entries_popped.saturating_sub(count);
        self.available.fetch_add(count, Ordering::AcqRel);
    }

    /// Removes the unreserved tail for offloading.
    ///
    /// Entries already reserved by an in-flight pop stay resident so the
    /// matching [`Self::take`] still finds them.
    pub fn spill_out(&self) -> Vec<Entry> {
        let mut inner = self.inner.lock();
        let available = usize::try_from(self.available.load(Ordering::Acquire)).unwrap_or(usize::MAX);
        let outstanding = inner.resident.len().saturating_sub(available);
        let tail: Vec<Entry> = inner.resident.split_off(outstanding).into();
        inner.spilled += tail.len() as u64;
        tail
    }

    /// Appends offloaded entries back to the resident tail.
    pub fn restore(&self, entries: Vec<Entry>) {
        let mut inner = self.inner.lock();
        inner.spilled = inner.spilled.saturating_sub(entries.len() as u64);
        inner.resident.extend(entries);
    }

    /// Stops further pushes.
    pub fn close_for_push(&self) {
        self.closed_for_push.store(true, Ordering::Release);
    }

    /// True once the segment no longer accepts pushes.
    #[must_use]
    pub fn is_closed_for_push(&self) -> bool {
        self.closed_for_push.load(Ordering::Acquire)
    }

    /// True once the segment is closed, empty and has nothing outstanding.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        let inner = self.inner.lock();
        self.is_closed_for_push()
            && self.available() == 0
            && inner.resident.is_empty()
            && inner.spilled == 0
    }

    /// Entries that can still be reserved.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.available.load(Ordering::Acquire)
    }

    /// Entries held in memory, reserved or not.
    #[must_use]
    pub fn resident_len(&self) -> u64 {
        self.inner.lock().resident.len() as u64
    }

    /// Bytes admitted so far.
    #[must_use]
    pub fn bytes_used(&self) -> u64 {
        self.inner.lock().bytes_used
    }

    /// Byte budget.
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Entries admitted by pushes.
    #[must_use]
    pub fn entries_pushed(&self) -> u64 {
        self.inner.lock().entries_pushed
    }

    /// Entries taken and not put back.
    #[must_use]
    pub fn entries_popped(&self) -> u64 {
        self.inner.lock().entries_popped
    }

    /// Lowest sequence id this segment has held.
    #[must_use]
    pub fn first_sequence(&self) -> Option<SequenceId> {
        self.inner.lock().first_sequence
    }
}
