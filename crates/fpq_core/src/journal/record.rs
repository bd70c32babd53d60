//! Journal record encoding and streaming decode.
//!
//! ```text
//! | sequence_id (8, LE) | payload_length (4, LE) | payload (N) |
//! ```
//!
//! Journal files, ack sidecars (payload_length = 0) and segment spill files
//! all use this layout.

use crate::error::{QueueError, QueueResult};
use crate::types::SequenceId;
use bytes::Bytes;
use fpq_storage::StorageBackend;
use std::path::Path;

/// Size of the fixed record header.
pub const RECORD_HEADER_SIZE: usize = 12;

/// Largest payload a record can describe.
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

/// Read window used while streaming records back.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Offset of the record header in its file.
    pub offset: u64,
    /// Sequence id stored in the header.
    pub sequence_id: SequenceId,
    /// Record payload; empty for acks.
    pub payload: Bytes,
}

/// Encoded size of a record carrying `payload_len` bytes.
#[must_use]
pub fn encoded_len(payload_len: usize) -> usize {
    RECORD_HEADER_SIZE + payload_len
}

/// Appends one encoded record to `buf`.
///
/// # Errors
///
/// Returns [`QueueError::InvalidState`] if the payload does not fit the
/// 4-byte length field.
pub fn encode_record(buf: &mut Vec<u8>, sequence_id: SequenceId, payload: &[u8]) -> QueueResult<()> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        QueueError::invalid_state(format!(
            "payload of {} bytes exceeds the {MAX_PAYLOAD_SIZE} byte record limit",
            payload.len()
        ))
    })?;
    buf.reserve(encoded_len(payload.len()));
    buf.extend_from_slice(&sequence_id.as_u64().to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(())
}

/// Appends an ack record (empty payload) to `buf`.
pub fn encode_ack(buf: &mut Vec<u8>, sequence_id: SequenceId) {
    buf.extend_from_slice(&sequence_id.as_u64().to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
}

/// Streams records out of a backend with a bounded read window.
///
/// A record whose header or payload runs past the end of the data is a torn
/// write from a crash: iteration stops there and [`Self::torn_at`] reports
/// the offset. Everything before it is valid.
pub struct RecordReader<'a> {
    backend: &'a dyn StorageBackend,
    size: u64,
    offset: u64,
    buffer: Vec<u8>,
    buffer_start: u64,
    torn_at: Option<u64>,
    finished: bool,
}

impl<'a> RecordReader<'a> {
    /// Creates a reader positioned at the start of `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn new(backend: &'a dyn StorageBackend) -> QueueResult<Self> {
        Ok(Self {
            backend,
            size: backend.size()?,
            offset: 0,
            buffer: Vec::new(),
            buffer_start: 0,
            torn_at: None,
            finished: false,
        })
    }

    /// Offset of a torn trailing record, if one was found.
    #[must_use]
    pub fn torn_at(&self) -> Option<u64> {
        self.torn_at
    }

    /// Offset just past the last valid record read so far.
    #[must_use]
    pub fn valid_len(&self) -> u64 {
        self.offset
    }

    /// Returns `len` bytes at `offset`, or `None` if they extend past the end.
    fn window(&mut self, offset: u64, len: usize) -> QueueResult<Option<&[u8]>> {
        let end = offset.saturating_add(len as u64);
        if end > self.size {
            return Ok(None);
        }

        let buffer_end = self.buffer_start + self.buffer.len() as u64;
        if offset < self.buffer_start || end > buffer_end {
            let want = len.max(READ_BUFFER_SIZE) as u64;
            let read_len = want.min(self.size - offset) as usize;
            self.buffer = self.backend.read_at(offset, read_len)?;
            self.buffer_start = offset;
        }

        let start = (offset - self.buffer_start) as usize;
        Ok(Some(&self.buffer[start..start + len]))
    }

    fn next_record(&mut self) -> QueueResult<Option<Record>> {
        let offset = self.offset;
        if offset == self.size {
            return Ok(None);
        }

        let Some(header) = self.window(offset, RECORD_HEADER_SIZE)? else {
            self.torn_at = Some(offset);
            return Ok(None);
        };
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&header[..8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&header[8..RECORD_HEADER_SIZE]);
        let sequence_id = SequenceId::new(u64::from_le_bytes(seq));
        let payload_len = u32::from_le_bytes(len) as usize;

        let payload_offset = offset + RECORD_HEADER_SIZE as u64;
        let Some(payload) = self.window(payload_offset, payload_len)? else {
            self.torn_at = Some(offset);
            return Ok(None);
        };
        let payload = Bytes::copy_from_slice(payload);

        self.offset = payload_offset + payload_len as u64;
        Ok(Some(Record {
            offset,
            sequence_id,
            payload,
        }))
    }
}

impl Iterator for RecordReader<'_> {
    type Item = QueueResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Reads every complete record of a file that must not be torn.
///
/// # Errors
///
/// Returns [`QueueError::CorruptRecord`] if the data ends mid-record.
pub fn read_complete(backend: &dyn StorageBackend, path: &Path) -> QueueResult<Vec<Record>> {
    let mut reader = RecordReader::new(backend)?;
    let records = reader.by_ref().collect::<QueueResult<Vec<_>>>()?;
    if let Some(offset) = reader.torn_at() {
        return Err(QueueError::corrupt_record(path, offset, "record truncated"));
    }
    Ok(records)
}
