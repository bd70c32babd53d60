//! # FPQ Storage
//!
//! Byte-store backends for the FPQ persistent queue.
//!
//! The queue engine keeps two kinds of files on disk: append-only journal
//! files (plus their consumption acks) and spill files for memory segments
//! that were evicted under RAM pressure. Both are written through the
//! [`StorageBackend`] trait defined here. Backends are **opaque byte
//! stores**: they never interpret the records they hold.
//!
//! ## Available Backends
//!
//! - [`FileBackend`] - persistent storage using OS file APIs
//! - [`InMemoryBackend`] - for tests and ephemeral queues
//!
//! ## Example
//!
//! ```rust
//! use fpq_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"event").unwrap();
//! assert_eq!(backend.read_at(offset, 5).unwrap(), b"event");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod factory;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use factory::{BackendFactory, FileBackendFactory};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
