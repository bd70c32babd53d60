//! Core type definitions for FPQ.

use bytes::Bytes;
use std::fmt;
use uuid::Uuid;

/// Sequence number assigned by the journal to every appended entry.
///
/// Sequence ids are monotonically increasing and never reused, including
/// across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceId(pub u64);

impl SequenceId {
    /// Creates a new sequence id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence id.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Identifier of a journal file. Files are numbered sequentially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JournalFileId(pub u64);

impl JournalFileId {
    /// Creates a new journal file id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the id of the file opened after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for JournalFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "journal:{}", self.0)
    }
}

/// Identifier of an in-memory segment; also names its spill file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId(Uuid);

impl SegmentId {
    /// Generates a fresh random segment id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment:{}", self.0.simple())
    }
}

/// An event stored in the queue.
///
/// Entries are created by the journal on append and are immutable from then
/// on. Cloning is cheap: the payload is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    sequence_id: SequenceId,
    journal_id: JournalFileId,
    payload: Bytes,
}

impl Entry {
    /// Creates an entry.
    #[must_use]
    pub fn new(sequence_id: SequenceId, journal_id: JournalFileId, payload: Bytes) -> Self {
        Self {
            sequence_id,
            journal_id,
            payload,
        }
    }

    /// Returns the sequence id assigned by the journal.
    #[must_use]
    pub fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    /// Returns the journal file holding the durable copy of this entry.
    #[must_use]
    pub fn journal_id(&self) -> JournalFileId {
        self.journal_id
    }

    /// Returns the event payload.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the entry and returns its payload.
    #[must_use]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Bytes this entry counts against a segment's budget.
    #[must_use]
    pub fn size_in_bytes(&self) -> u64 {
        self.payload.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_id_next() {
        assert_eq!(SequenceId::new(5).next().as_u64(), 6);
        assert!(SequenceId::new(1) < SequenceId::new(2));
    }

    #[test]
    fn journal_file_id_display() {
        assert_eq!(format!("{}", JournalFileId::new(42)), "journal:42");
    }

    #[test]
    fn segment_ids_are_unique() {
        assert_ne!(SegmentId::generate(), SegmentId::generate());
    }

    #[test]
    fn entry_accessors() {
        let entry = Entry::new(
            SequenceId::new(7),
            JournalFileId::new(1),
            Bytes::from_static(b"abc"),
        );
        assert_eq!(entry.sequence_id(), SequenceId::new(7));
        assert_eq!(entry.journal_id(), JournalFileId::new(1));
        assert_eq!(entry.size_in_bytes(), 3);
        assert_eq!(entry.into_payload(), Bytes::from_static(b"abc"));
    }
}
