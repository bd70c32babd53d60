//! Per-transaction scratch state.

use crate::error::{QueueError, QueueResult};
use crate::memory::PoppedBatch;
use crate::types::{Entry, SegmentId};
use bytes::Bytes;

/// What a context is accumulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextMode {
    /// Nothing pending.
    #[default]
    Idle,
    /// Holding payloads for a push commit.
    Pushing,
    /// Holding entries for a pop commit.
    Popping,
}

/// Scratch accumulator for one push or pop transaction.
///
/// Created by [`crate::PersistentQueue::create_context`] and passed by
/// `&mut` to every call of the transaction; one context is never shared
/// between threads at once. Every mutation checks mode and capacity first
/// and changes nothing when the check fails.
#[derive(Debug)]
pub struct TransactionContext {
    capacity: usize,
    mode: ContextMode,
    pending: Vec<Bytes>,
    popped: Vec<Entry>,
    /// Runs of `popped` by originating segment, in pop order.
    origins: Vec<(SegmentId, usize)>,
}

impl TransactionContext {
    /// Creates an idle context holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            mode: ContextMode::Idle,
            pending: Vec::new(),
            popped: Vec::new(),
            origins: Vec::new(),
        }
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> ContextMode {
        self.mode
    }

    /// True while holding push payloads.
    #[must_use]
    pub fn is_pushing(&self) -> bool {
        self.mode == ContextMode::Pushing
    }

    /// True while holding popped entries.
    #[must_use]
    pub fn is_popping(&self) -> bool {
        self.mode == ContextMode::Popping
    }

    /// Number of payloads or entries held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len() + self.popped.len()
    }

    /// True when nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries that can still be added.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Payloads waiting for a push commit.
    #[must_use]
    pub fn pending(&self) -> &[Bytes] {
        &self.pending
    }

    /// Entries popped so far, oldest first.
    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        &self.popped
    }

    /// Adds payloads to a push transaction.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidState`] while popping and
    /// [`QueueError::TransactionSizeExceeded`] if the context would hold
    /// more than its capacity. The context is unchanged on error.
    pub fn push_into(&mut self, events: Vec<Bytes>) -> QueueResult<()> {
        if self.is_popping() {
            return Err(QueueError::invalid_state(
                "cannot push into a context holding popped entries",
            ));
        }
        let requested = self.len() + events.len();
        if requested > self.capacity {
            return Err(QueueError::transaction_size_exceeded(requested, self.capacity));
        }
        if events.is_empty() {
            return Ok(());
        }

        self.pending.extend(events);
        self.mode = ContextMode::Pushing;
        Ok(())
    }

    /// Checks that up to `size` more entries may be popped into this
    /// context.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidState`] while pushing and
    /// [`QueueError::TransactionSizeExceeded`] if `size` entries would not
    /// fit.
    pub fn check_pop(&self, size: usize) -> QueueResult<()> {
        if self.is_pushing() {
            return Err(QueueError::invalid_state(
                "cannot pop into a context holding pending pushes",
            ));
        }
        let requested = self.len().saturating_add(size);
        if size > self.capacity || requested > self.capacity {
            return Err(QueueError::transaction_size_exceeded(requested, self.capacity));
        }
        Ok(())
    }

    /// Takes ownership of a popped batch, or hands it back if it does not
    /// fit.
    pub(crate) fn adopt_popped(&mut self, batch: PoppedBatch) -> Result<(), PoppedBatch> {
        if self.is_pushing() || self.len() + batch.entries.len() > self.capacity {
            return Err(batch);
        }
        if batch.entries.is_empty() {
            return Ok(());
        }

        match self.origins.last_mut() {
            Some((segment, count)) if *segment == batch.segment => *count += batch.entries.len(),
            _ => self.origins.push((batch.segment, batch.entries.len())),
        }
        self.popped.extend(batch.entries);
        self.mode = ContextMode::Popping;
        Ok(())
    }

    /// Removes the popped entries as per-segment batches in pop order and
    /// resets the context.
    pub(crate) fn take_popped(&mut self) -> Vec<PoppedBatch> {
        let mut entries = std::mem::take(&mut self.popped).into_iter();
        let batches = std::mem::take(&mut self.origins)
            .into_iter()
            .map(|(segment, count)| PoppedBatch {
                segment,
                entries: entries.by_ref().take(count).collect(),
            })
            .collect();
        self.reset();
        batches
    }

    /// Drops everything held and returns to idle.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.popped.clear();
        self.origins.clear();
        self.mode = ContextMode::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JournalFileId, SequenceId};
    use proptest::prelude::*;

    fn events(n: usize) -> Vec<Bytes> {
        (0..n).map(|i| Bytes::from(format!("e{i}"))).collect()
    }

    fn batch(segment: SegmentId, seqs: std::ops::Range<u64>) -> PoppedBatch {
        PoppedBatch {
            segment,
            entries: seqs
                .map(|s| Entry::new(SequenceId::new(s), JournalFileId::new(1), Bytes::new()))
                .collect(),
        }
    }

    #[test]
    fn new_context_is_idle() {
        let ctx = TransactionContext::new(10);
        assert_eq!(ctx.mode(), ContextMode::Idle);
        assert!(ctx.is_empty());
        assert_eq!(ctx.capacity(), 10);
        assert_eq!(ctx.remaining(), 10);
    }

    #[test]
    fn push_accumulates() {
        let mut ctx = TransactionContext::new(10);
        ctx.push_into(events(4)).unwrap();
        ctx.push_into(events(6)).unwrap();
        assert!(ctx.is_pushing());
        assert_eq!(ctx.len(), 10);
        assert_eq!(ctx.remaining(), 0);
    }

    #[test]
    fn oversized_push_leaves_context_unchanged() {
        let mut ctx = TransactionContext::new(5);
        ctx.push_into(events(3)).unwrap();

        let err = ctx.push_into(events(3)).unwrap_err();
        assert!(matches!(
            err,
            QueueError::TransactionSizeExceeded { requested: 6, max: 5 }
        ));
        assert_eq!(ctx.len(), 3);
        assert_eq!(ctx.pending()[2], Bytes::from("e2"));
    }

    #[test]
    fn empty_push_stays_idle() {
        let mut ctx = TransactionContext::new(5);
        ctx.push_into(Vec::new()).unwrap();
        assert_eq!(ctx.mode(), ContextMode::Idle);
    }

    #[test]
    fn modes_are_exclusive() {
        let mut ctx = TransactionContext::new(10);
        ctx.push_into(events(1)).unwrap();
        assert!(matches!(ctx.check_pop(1), Err(QueueError::InvalidState { .. })));
        assert!(ctx.adopt_popped(batch(SegmentId::generate(), 1..2)).is_err());

        ctx.reset();
        ctx.adopt_popped(batch(SegmentId::generate(), 1..2)).unwrap();
        assert!(ctx.is_popping());
        assert!(matches!(
            ctx.push_into(events(1)),
            Err(QueueError::InvalidState { .. })
        ));
    }

    #[test]
    fn pop_size_checks() {
        let mut ctx = TransactionContext::new(10);
        assert!(ctx.check_pop(10).is_ok());
        assert!(ctx.check_pop(11).is_err());

        ctx.adopt_popped(batch(SegmentId::generate(), 1..8)).unwrap();
        assert!(ctx.check_pop(3).is_ok());
        assert!(matches!(
            ctx.check_pop(4),
            Err(QueueError::TransactionSizeExceeded { requested: 11, max: 10 })
        ));
    }

    #[test]
    fn popped_batches_come_back_by_segment() {
        let a = SegmentId::generate();
        let b = SegmentId::generate();
        let mut ctx = TransactionContext::new(20);
        ctx.adopt_popped(batch(a, 1..3)).unwrap();
        ctx.adopt_popped(batch(a, 3..5)).unwrap();
        ctx.adopt_popped(batch(b, 5..8)).unwrap();
        assert_eq!(ctx.entries().len(), 7);

        let batches = ctx.take_popped();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].segment, a);
        assert_eq!(batches[0].entries.len(), 4);
        assert_eq!(batches[1].entries[0].sequence_id(), SequenceId::new(5));
        assert_eq!(ctx.mode(), ContextMode::Idle);
        assert!(ctx.is_empty());
    }

    proptest! {
        #[test]
        fn length_never_exceeds_capacity(
            capacity in 1usize..50,
            pushes in prop::collection::vec(0usize..20, 1..20),
        ) {
            let mut ctx = TransactionContext::new(capacity);
            for n in pushes {
                let before = ctx.len();
                match ctx.push_into(events(n)) {
                    Ok(()) => prop_assert_eq!(ctx.len(), before + n),
                    Err(_) => prop_assert_eq!(ctx.len(), before),
                }
                prop_assert!(ctx.len() <= capacity);
            }
        }
    }
}
