//! Stress tests for FPQ.
//!
//! These helpers drive a queue from many threads at once and report what
//! came out, so tests can check for loss and duplication.

use crate::fixtures::SETTLE_TIMEOUT;
use bytes::Bytes;
use fpq_core::PersistentQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of events to push or pop.
    pub events: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Size of each payload in bytes (at least 8; the first 8 carry an id).
    pub payload_size: usize,
    /// Entries per transaction.
    pub batch_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            events: 10_000,
            threads: 4,
            payload_size: 64,
            batch_size: 50,
        }
    }
}

/// Builds payload `id`: its big-endian id padded to `size` bytes.
pub fn stress_payload(id: u64, size: usize) -> Bytes {
    let mut payload = id.to_be_bytes().to_vec();
    payload.resize(size.max(8), 0xAB);
    Bytes::from(payload)
}

/// Reads the id back out of a [`stress_payload`].
pub fn stress_payload_id(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = payload.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// What a multi-threaded run popped.
#[derive(Debug, Clone)]
pub struct PopOutcome {
    /// Throughput figures; one operation is one committed pop transaction.
    pub result: StressTestResult,
    /// Every payload popped and committed, per thread, in pop order.
    pub popped: Vec<Vec<Bytes>>,
}

impl PopOutcome {
    /// All popped payloads in one list.
    pub fn all(&self) -> Vec<Bytes> {
        self.popped.iter().flatten().cloned().collect()
    }
}

/// Pushes `config.events` numbered payloads from one thread in
/// transactions of `config.batch_size`.
pub fn stress_push_commits(queue: &PersistentQueue, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    let mut ctx = queue.create_context();
    let mut next = 0u64;
    while (next as usize) < config.events {
        let end = (next as usize + config.batch_size).min(config.events) as u64;
        let batch: Vec<Bytes> = (next..end)
            .map(|id| stress_payload(id, config.payload_size))
            .collect();
        next = end;

        let outcome = queue
            .push(&mut ctx, batch)
            .and_then(|()| queue.commit(&mut ctx));
        match outcome {
            Ok(()) => successful += 1,
            Err(_) => {
                queue.rollback(&mut ctx);
                failed += 1;
            }
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Pops from `config.threads` threads until `expected` entries have been
/// committed in total or the settle timeout passes.
pub fn stress_concurrent_pops(
    queue: Arc<PersistentQueue>,
    config: &StressConfig,
    expected: usize,
) -> PopOutcome {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let consumed = Arc::new(AtomicUsize::new(0));
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let consumed = Arc::clone(&consumed);
            let batch_size = config.batch_size;

            thread::spawn(move || {
                let mut mine = Vec::new();
                let mut ctx = queue.create_context();
                while consumed.load(Ordering::Acquire) < expected && Instant::now() < deadline {
                    let popped: Vec<Bytes> = match queue.pop(&mut ctx, batch_size) {
                        Ok(entries) => entries.iter().map(|e| e.payload().clone()).collect(),
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            queue.rollback(&mut ctx);
                            continue;
                        }
                    };
                    if popped.is_empty() {
                        thread::yield_now();
                        continue;
                    }

                    match queue.commit(&mut ctx) {
                        Ok(()) => {
                            successful.fetch_add(1, Ordering::Relaxed);
                            consumed.fetch_add(popped.len(), Ordering::AcqRel);
                            mine.extend(popped);
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                mine
            })
        })
        .collect();

    let popped = handles
        .into_iter()
        .map(|handle| handle.join().expect("Thread panicked"))
        .collect();

    PopOutcome {
        result: StressTestResult::new(
            successful.load(Ordering::Relaxed),
            failed.load(Ordering::Relaxed),
            start.elapsed(),
        ),
        popped,
    }
}

/// Runs `config.threads` producers and as many consumers at once. Each
/// producer pushes `config.events / config.threads` payloads with ids
/// unique across producers.
pub fn stress_producers_consumers(queue: Arc<PersistentQueue>, config: &StressConfig) -> PopOutcome {
    let per_producer = config.events / config.threads.max(1);
    let producers: Vec<_> = (0..config.threads)
        .map(|p| {
            let queue = Arc::clone(&queue);
            let config = config.clone();
            thread::spawn(move || {
                let mut ctx = queue.create_context();
                let first = (p * per_producer) as u64;
                let ids: Vec<u64> = (first..first + per_producer as u64).collect();
                for chunk in ids.chunks(config.batch_size.max(1)) {
                    let batch: Vec<Bytes> = chunk
                        .iter()
                        .map(|&id| stress_payload(id, config.payload_size))
                        .collect();
                    queue.push(&mut ctx, batch).expect("Failed to push");
                    queue.commit(&mut ctx).expect("Failed to commit push");
                }
            })
        })
        .collect();

    let outcome = stress_concurrent_pops(queue, config, per_producer * config.threads);
    for producer in producers {
        producer.join().expect("Thread panicked");
    }
    outcome
}

/// Pops batches and rolls every other one back, then drains the rest.
/// Returns the payloads committed, in order.
pub fn stress_pop_rollbacks(queue: &PersistentQueue, config: &StressConfig) -> Vec<Bytes> {
    let mut ctx = queue.create_context();
    let mut committed = Vec::new();
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    let mut round = 0usize;

    while !queue.is_empty() && Instant::now() < deadline {
        let popped: Vec<Bytes> = queue
            .pop(&mut ctx, config.batch_size)
            .expect("Failed to pop")
            .iter()
            .map(|e| e.payload().clone())
            .collect();
        if popped.is_empty() {
            thread::yield_now();
            continue;
        }

        round += 1;
        if round % 2 == 1 {
            queue.rollback(&mut ctx);
        } else {
            queue.commit(&mut ctx).expect("Failed to commit pop");
            committed.extend(popped);
        }
    }
    committed
}
