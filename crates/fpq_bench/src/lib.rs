//! Benchmarks for FPQ.
//!
//! The benchmarks live under `benches/`; this crate only carries shared
//! data generators.

pub mod utils;
