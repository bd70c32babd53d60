//! Crash simulation for FPQ.
//!
//! Two tools: [`CrashableBackend`] wraps a storage backend and fails writes
//! or syncs on demand ([`CrashableFactory`] hands such backends to a whole
//! queue), and the file helpers damage journal files on disk the way a
//! crash mid-write would.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fpq_testkit::crash::tear_last_journal;
//!
//! let queue = queue.reopen_after(|dir| {
//!     tear_last_journal(dir, 3);
//! });
//! ```

use fpq_storage::{
    BackendFactory, FileBackendFactory, StorageBackend, StorageError, StorageResult,
};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared switches for a [`CrashableBackend`], kept by the test after the
/// backend itself is handed to the code under test.
#[derive(Debug)]
pub struct CrashSwitch {
    crash_after_bytes: AtomicUsize,
    bytes_written: AtomicUsize,
    crashed: AtomicBool,
    fail_on_sync: AtomicBool,
}

impl CrashSwitch {
    /// Creates a switch that never fires.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            crash_after_bytes: AtomicUsize::new(usize::MAX),
            bytes_written: AtomicUsize::new(0),
            crashed: AtomicBool::new(false),
            fail_on_sync: AtomicBool::new(false),
        })
    }

    /// Makes the backend fail once the given number of bytes has been
    /// written. The write that crosses the threshold is cut short.
    pub fn crash_after(&self, bytes: usize) {
        self.crash_after_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Sets whether sync should fail.
    pub fn set_fail_on_sync(&self, fail: bool) {
        self.fail_on_sync.store(fail, Ordering::SeqCst);
    }

    /// Resets the crash state.
    pub fn reset(&self) {
        self.crash_after_bytes.store(usize::MAX, Ordering::SeqCst);
        self.bytes_written.store(0, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.fail_on_sync.store(false, Ordering::SeqCst);
    }

    /// Returns whether the backend has failed a call.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }
}

/// A storage backend wrapper that can simulate crashes.
pub struct CrashableBackend {
    inner: Box<dyn StorageBackend>,
    switch: Arc<CrashSwitch>,
}

impl CrashableBackend {
    /// Wraps `inner`, controlled by `switch`.
    pub fn new(inner: Box<dyn StorageBackend>, switch: Arc<CrashSwitch>) -> Self {
        Self { inner, switch }
    }

    fn simulated(&self, what: &str) -> StorageError {
        self.switch.crashed.store(true, Ordering::SeqCst);
        StorageError::Io(io::Error::other(format!("simulated crash during {what}")))
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let current = self
            .switch
            .bytes_written
            .fetch_add(data.len(), Ordering::SeqCst);
        let threshold = self.switch.crash_after_bytes.load(Ordering::SeqCst);

        if current >= threshold {
            return Err(self.simulated("write"));
        }
        if current + data.len() > threshold {
            let partial = threshold - current;
            let _ = self.inner.append(&data[..partial]);
            return Err(self.simulated("partial write"));
        }
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.switch.fail_on_sync.load(Ordering::SeqCst) {
            return Err(self.simulated("sync"));
        }
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

/// Opens journal files as [`CrashableBackend`]s over real files, all wired
/// to one switch.
///
/// Every record and ack write of the queue counts against the same byte
/// budget, so `switch.reset()` followed by `crash_after(n)` fails the write
/// that crosses the `n`th byte from that point on.
pub struct CrashableFactory {
    switch: Arc<CrashSwitch>,
}

impl CrashableFactory {
    /// Creates a factory controlled by `switch`.
    pub fn new(switch: Arc<CrashSwitch>) -> Arc<Self> {
        Arc::new(Self { switch })
    }
}

impl BackendFactory for CrashableFactory {
    fn create(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        let inner = FileBackendFactory.create(path)?;
        Ok(Box::new(CrashableBackend::new(inner, Arc::clone(&self.switch))))
    }

    fn open(&self, path: &Path) -> StorageResult<Box<dyn StorageBackend>> {
        let inner = FileBackendFactory.open(path)?;
        Ok(Box::new(CrashableBackend::new(inner, Arc::clone(&self.switch))))
    }
}

/// Journal record files in `dir`, oldest first.
pub fn journal_paths(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .expect("Failed to read journal directory")
        .map(|entry| entry.expect("Failed to read directory entry").path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("log"))
        .collect();
    paths.sort();
    paths
}

/// Cuts `bytes` off the end of the newest non-empty journal file, leaving a
/// torn trailing record. Returns the file that was cut.
pub fn tear_last_journal(dir: &Path, bytes: u64) -> PathBuf {
    let path = journal_paths(dir)
        .into_iter()
        .rev()
        .find(|p| fs::metadata(p).map(|m| m.len() > bytes).unwrap_or(false))
        .expect("No journal file large enough to tear");
    let len = fs::metadata(&path).expect("Failed to stat journal").len();
    let file = OpenOptions::new()
        .write(true)
        .open(&path)
        .expect("Failed to open journal");
    file.set_len(len - bytes).expect("Failed to truncate journal");
    path
}

/// Appends raw bytes to a file, e.g. the start of a record header that
/// never finished.
pub fn append_garbage(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .expect("Failed to open file");
    file.write_all(bytes).expect("Failed to append garbage");
}
