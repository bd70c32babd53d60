//! Benchmark utilities.

use bytes::Bytes;
use fpq_core::{Config, PersistentQueue};
use rand::Rng;
use tempfile::TempDir;

/// Generate random payload data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate a batch of random payloads.
pub fn random_payloads(count: usize, size: usize) -> Vec<Bytes> {
    (0..count).map(|_| Bytes::from(random_data(size))).collect()
}

/// Opens a queue in a fresh temporary directory. Keep the directory alive
/// for as long as the queue is used.
pub fn temp_queue(adjust: impl FnOnce(Config) -> Config) -> (PersistentQueue, TempDir) {
    let dir = TempDir::new().unwrap();
    let queue = PersistentQueue::open(adjust(Config::new(dir.path()))).unwrap();
    (queue, dir)
}
