//! Segmented in-memory queue with disk overflow.
//!
//! Committed entries are published here after they reach the journal.
//! The queue is a list of byte-bounded [`Segment`]s; under memory pressure
//! whole segments are offloaded to spill files and read back on demand.

mod descriptor;
mod queue;
mod segment;
mod spill;

pub use descriptor::{ReloadThrottle, SegmentDescriptor, SegmentSnapshot, SegmentStatus};
pub use queue::{MemoryQueue, PoppedBatch};
pub use segment::{batch_footprint, entry_footprint, Segment};
pub use spill::SpillHandle;
