//! # FPQ Testkit
//!
//! Test utilities for FPQ.
//!
//! This crate provides:
//! - Temporary queue fixtures and transaction helpers
//! - Property-based test generators using proptest
//! - Stress testing utilities for concurrent producers and consumers
//! - Crash simulation helpers for journal files and storage backends
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fpq_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_queue() {
//!     let queue = TestQueue::new();
//!     push_committed(&queue, ["a", "b"]);
//!     assert_eq!(drain_committed(&queue, 10).len(), 2);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
    pub use crate::init_test_logging;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;

/// Installs a `tracing` subscriber for tests, filtered by `RUST_LOG`
/// (default `warn`). Safe to call from every test; only the first call
/// installs anything.
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
