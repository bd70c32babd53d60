//! Error types for the FPQ queue engine.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors that can occur in FPQ queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The configuration is invalid. Fatal at open.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// A push or pop would take a context beyond its capacity.
    ///
    /// The context is left exactly as it was before the call.
    #[error("transaction size exceeded: {requested} entries requested, maximum is {max}")]
    TransactionSizeExceeded {
        /// Number of entries the context would hold after the operation.
        requested: usize,
        /// Configured maximum transaction size.
        max: usize,
    },

    /// A push batch is larger than one memory segment can hold.
    ///
    /// Raised at commit before anything is journaled; the context keeps its
    /// payloads.
    #[error("batch too large: {bytes} bytes, segment limit is {max}")]
    BatchTooLarge {
        /// Encoded size of the batch.
        bytes: u64,
        /// Configured maximum segment size.
        max: u64,
    },

    /// Journal or spill file storage failed.
    #[error("journal storage error: {0}")]
    Storage(#[from] fpq_storage::StorageError),

    /// Direct filesystem operation failed.
    #[error("journal I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record could not be decoded.
    #[error("corrupt record in {} at offset {offset}: {message}", path.display())]
    CorruptRecord {
        /// File holding the record.
        path: PathBuf,
        /// Offset of the record within the file.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// An operation was attempted in a state that does not allow it.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Another process holds the journal directory.
    #[error("journal directory locked: another process owns it")]
    QueueLocked,

    /// The queue has been shut down.
    #[error("queue is shut down")]
    Closed,
}

impl QueueError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a transaction size error.
    pub fn transaction_size_exceeded(requested: usize, max: usize) -> Self {
        Self::TransactionSizeExceeded { requested, max }
    }

    /// Creates a batch size error.
    pub fn batch_too_large(bytes: u64, max: u64) -> Self {
        Self::BatchTooLarge { bytes, max }
    }

    /// Creates a corrupt record error.
    pub fn corrupt_record(path: impl Into<PathBuf>, offset: u64, message: impl Into<String>) -> Self {
        Self::CorruptRecord {
            path: path.into(),
            offset,
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Returns true for failures of the journal's durable storage.
    ///
    /// A push whose commit failed this way is still held by its context and
    /// can be committed again.
    #[must_use]
    pub fn is_journal_io(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }
}
