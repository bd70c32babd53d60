//! Write-ahead journal.
//!
//! Every pushed entry is appended to the journal before it becomes visible
//! to consumers, and every committed pop is acknowledged back to it. The
//! journal is a numbered sequence of append-only files:
//!
//! ```text
//! journal-00000000000000000001.log   sealed, 3 entries unconsumed
//! journal-00000000000000000001.ack
//! journal-00000000000000000002.log   current
//! journal-00000000000000000002.ack
//! ```
//!
//! A file is sealed when it grows past the configured size or age and
//! deleted once all of its entries are consumed. At open, the files still
//! present are scanned and every record without an ack is handed back for
//! replay.

mod file;
mod manager;
mod record;
mod recovery;

pub use file::{JournalFile, JournalFileDescriptor, JournalFileStatus};
pub use manager::JournalManager;
pub use record::{
    encode_ack, encode_record, encoded_len, read_complete, Record, RecordReader,
    MAX_PAYLOAD_SIZE, RECORD_HEADER_SIZE,
};
