//! # FPQ Core
//!
//! Transactional queue engine for FPQ, a disk-durable FIFO queue.
//!
//! This crate provides:
//! - [`PersistentQueue`], the facade producers and consumers talk to
//! - [`TransactionContext`], the per-transaction scratch state
//! - the write-ahead [`journal`]: rolling files, background fsync,
//!   consumption acks and crash recovery
//! - the segmented [`memory`] queue with disk overflow
//!
//! ## Transactions
//!
//! ```text
//! push -> ctx -> commit -> journal append -> memory publish
//! pop  -> memory reserve + dequeue -> ctx -> commit -> journal ack
//! ```
//!
//! A pushed entry survives a crash once the journal file holding it has
//! been flushed, which happens every `flush_period_ms` or on
//! [`PersistentQueue::flush`]. Delivery is at least once: entries popped
//! but not committed before a crash come back after the next open.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod context;
mod dir;
mod error;
pub mod journal;
pub mod memory;
mod queue;
mod stats;
mod types;
mod worker;

pub use config::{Config, MIN_NUMBER_OF_SEGMENTS};
pub use context::{ContextMode, TransactionContext};
pub use dir::QueueDir;
pub use error::{QueueError, QueueResult};
pub use journal::{JournalFileDescriptor, JournalFileStatus, JournalManager};
pub use memory::{MemoryQueue, PoppedBatch, SegmentSnapshot, SegmentStatus};
pub use queue::PersistentQueue;
pub use stats::{QueueStats, QueueStatsSnapshot};
pub use types::{Entry, JournalFileId, SegmentId, SequenceId};
