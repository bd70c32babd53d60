//! A single journal file and its consumption bookkeeping.

use crate::dir::QueueDir;
use crate::error::{QueueError, QueueResult};
use crate::journal::record::{Record, RecordReader};
use crate::types::{JournalFileId, SequenceId};
use fpq_storage::{BackendFactory, StorageBackend};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tracing::warn;

/// Lifecycle of a journal file.
///
/// ```text
/// Current --roll--> Sealed --drained--> Deleting --reaper--> Deleted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalFileStatus {
    /// Receiving appends.
    Current,
    /// Closed to appends; waiting for its entries to be consumed.
    Sealed,
    /// Drained and queued on the reaper.
    Deleting,
    /// Removed from disk.
    Deleted,
}

impl JournalFileStatus {
    /// Checks a transition and returns the new status.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidState`] for any transition not shown in
    /// the lifecycle diagram.
    pub fn transition(self, next: Self) -> QueueResult<Self> {
        use JournalFileStatus::{Current, Deleted, Deleting, Sealed};
        match (self, next) {
            (Current, Sealed) | (Sealed, Deleting) | (Deleting, Deleted) => Ok(next),
            _ => Err(QueueError::invalid_state(format!(
                "journal file cannot move from {self:?} to {next:?}"
            ))),
        }
    }
}

/// Point-in-time view of a journal file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalFileDescriptor {
    /// File id.
    pub id: JournalFileId,
    /// Wall-clock creation time, read from disk for recovered files.
    pub created_at: SystemTime,
    /// Bytes of valid records.
    pub size_bytes: u64,
    /// Records written.
    pub entries_written: u64,
    /// Records not yet reported consumed.
    pub entries_unconsumed: u64,
    /// Current lifecycle status.
    pub status: JournalFileStatus,
}

impl JournalFileDescriptor {
    /// True while the file receives appends.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.status == JournalFileStatus::Current
    }
}

/// Records read back from a journal at open.
#[derive(Debug)]
pub(crate) struct Replay {
    pub(crate) records: Vec<Record>,
    pub(crate) acked: HashSet<SequenceId>,
    pub(crate) torn_at: Option<u64>,
}

/// A journal file: the record log plus its ack sidecar.
pub struct JournalFile {
    id: JournalFileId,
    path: PathBuf,
    ack_path: PathBuf,
    created_at: SystemTime,
    opened_at: Instant,
    records: Mutex<Box<dyn StorageBackend>>,
    acks: Mutex<Box<dyn StorageBackend>>,
    size_bytes: AtomicU64,
    entries_written: AtomicU64,
    entries_unconsumed: AtomicU64,
    dirty: AtomicBool,
    status: Mutex<JournalFileStatus>,
}

impl JournalFile {
    /// Creates a fresh, current journal file in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if either file already exists or cannot be created.
    pub fn create(
        dir: &QueueDir,
        id: JournalFileId,
        backends: &dyn BackendFactory,
    ) -> QueueResult<Self> {
        let path = dir.journal_path(id);
        let ack_path = dir.ack_path(id);
        let records = backends.create(&path)?;
        let acks = backends.create(&ack_path)?;
        Ok(Self::with_backends(
            id,
            path,
            ack_path,
            records,
            acks,
            JournalFileStatus::Current,
        ))
    }

    /// Opens a journal left by a previous process. It is sealed: recovered
    /// files never receive appends.
    ///
    /// The creation time is read back from the record file's metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be opened.
    pub fn open_existing(
        dir: &QueueDir,
        id: JournalFileId,
        backends: &dyn BackendFactory,
    ) -> QueueResult<Self> {
        let path = dir.journal_path(id);
        let ack_path = dir.ack_path(id);
        let created_at = file_created_at(&path)?;
        let records = backends.open(&path)?;
        let acks = backends.open(&ack_path)?;
        let mut file = Self::with_backends(
            id,
            path,
            ack_path,
            records,
            acks,
            JournalFileStatus::Sealed,
        );
        file.created_at = created_at;
        Ok(file)
    }

    /// Builds a journal file over arbitrary backends.
    pub fn with_backends(
        id: JournalFileId,
        path: PathBuf,
        ack_path: PathBuf,
        records: Box<dyn StorageBackend>,
        acks: Box<dyn StorageBackend>,
        status: JournalFileStatus,
    ) -> Self {
        let size = records.size().unwrap_or(0);
        Self {
            id,
            path,
            ack_path,
            created_at: SystemTime::now(),
            opened_at: Instant::now(),
            records: Mutex::new(records),
            acks: Mutex::new(acks),
            size_bytes: AtomicU64::new(size),
            entries_written: AtomicU64::new(0),
            entries_unconsumed: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            status: Mutex::new(status),
        }
    }

    /// Returns the file id.
    #[must_use]
    pub fn id(&self) -> JournalFileId {
        self.id
    }

    /// Returns the record file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> JournalFileStatus {
        *self.status.lock()
    }

    /// Returns the number of records not yet consumed.
    #[must_use]
    pub fn entries_unconsumed(&self) -> u64 {
        self.entries_unconsumed.load(Ordering::Acquire)
    }

    /// Returns a snapshot of the file's bookkeeping.
    #[must_use]
    pub fn descriptor(&self) -> JournalFileDescriptor {
        JournalFileDescriptor {
            id: self.id,
            created_at: self.created_at,
            size_bytes: self.size_bytes.load(Ordering::Acquire),
            entries_written: self.entries_written.load(Ordering::Acquire),
            entries_unconsumed: self.entries_unconsumed(),
            status: self.status(),
        }
    }

    /// True once the file is as large or as old as a roll allows.
    #[must_use]
    pub fn should_roll(&self, max_size: u64, max_age: Duration) -> bool {
        self.size_bytes.load(Ordering::Acquire) >= max_size || self.opened_at.elapsed() >= max_age
    }

    /// Appends `count` encoded records.
    ///
    /// On failure the file is cut back to its previous length so a short
    /// write never leaves a partial record counted as written.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the failed append.
    pub fn append_records(&self, encoded: &[u8], count: u64) -> QueueResult<()> {
        let mut records = self.records.lock();
        let before = records.size()?;
        if let Err(e) = records.append(encoded) {
            if let Err(undo) = records.truncate(before) {
                warn!(journal = %self.id, error = %undo, "failed to cut back short journal write");
            }
            return Err(e.into());
        }

        self.size_bytes.store(before + encoded.len() as u64, Ordering::Release);
        self.entries_written.fetch_add(count, Ordering::AcqRel);
        self.entries_unconsumed.fetch_add(count, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Appends encoded ack records and returns the sidecar length before the
    /// write, for [`Self::revert_acks`].
    ///
    /// # Errors
    ///
    /// Returns the storage error of the failed append; the sidecar is cut
    /// back first.
    pub fn append_acks(&self, encoded: &[u8]) -> QueueResult<u64> {
        let mut acks = self.acks.lock();
        let before = acks.size()?;
        if let Err(e) = acks.append(encoded) {
            if let Err(undo) = acks.truncate(before) {
                warn!(journal = %self.id, error = %undo, "failed to cut back short ack write");
            }
            return Err(e.into());
        }
        self.dirty.store(true, Ordering::Release);
        Ok(before)
    }

    /// Drops acks written after `len`.
    pub fn revert_acks(&self, len: u64) {
        if let Err(e) = self.acks.lock().truncate(len) {
            warn!(journal = %self.id, error = %e, "failed to revert ack records");
        }
    }

    /// Checks that `count` more entries can be consumed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidState`] when more entries are reported
    /// than remain unconsumed, which means a pop was committed twice.
    pub fn check_consumable(&self, count: u64) -> QueueResult<()> {
        let unconsumed = self.entries_unconsumed();
        if count > unconsumed {
            return Err(QueueError::invalid_state(format!(
                "{} reports {count} consumed entries but only {unconsumed} are outstanding",
                self.id
            )));
        }
        Ok(())
    }

    /// Records `count` consumed entries and returns how many remain.
    pub fn consume(&self, count: u64) -> u64 {
        let previous = self
            .entries_unconsumed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(count))
            })
            .unwrap_or(0);
        previous.saturating_sub(count)
    }

    /// Sets the counters rebuilt by recovery.
    pub(crate) fn restore_counts(&self, size_bytes: u64, written: u64, unconsumed: u64) {
        self.size_bytes.store(size_bytes, Ordering::Release);
        self.entries_written.store(written, Ordering::Release);
        self.entries_unconsumed.store(unconsumed, Ordering::Release);
    }

    /// Fsyncs both files if anything was written since the last sync.
    ///
    /// Returns whether a sync happened. Files already handed to the reaper
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Returns the storage error; the file stays dirty for the next attempt.
    pub fn sync(&self) -> QueueResult<bool> {
        let status = self.status.lock();
        if matches!(*status, JournalFileStatus::Deleting | JournalFileStatus::Deleted) {
            return Ok(false);
        }
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let result = self
            .records
            .lock()
            .sync()
            .and_then(|()| self.acks.lock().sync());
        if let Err(e) = result {
            self.dirty.store(true, Ordering::Release);
            return Err(e.into());
        }
        Ok(true)
    }

    /// Closes the file to appends.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidState`] unless the file is current.
    pub fn seal(&self) -> QueueResult<()> {
        let mut status = self.status.lock();
        *status = status.transition(JournalFileStatus::Sealed)?;
        Ok(())
    }

    /// Moves a sealed, drained file to `Deleting`. Returns true for exactly
    /// one caller per file.
    pub fn try_begin_delete(&self) -> bool {
        let mut status = self.status.lock();
        if *status != JournalFileStatus::Sealed || self.entries_unconsumed() != 0 {
            return false;
        }
        match status.transition(JournalFileStatus::Deleting) {
            Ok(next) => {
                *status = next;
                true
            }
            Err(_) => false,
        }
    }

    /// Closes the handles and removes both files from disk.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidState`] unless deletion was begun, or the
    /// I/O error of the removal.
    pub fn remove(&self) -> QueueResult<()> {
        let mut status = self.status.lock();
        let next = status.transition(JournalFileStatus::Deleted)?;

        self.records.lock().close();
        self.acks.lock().close();
        for path in [&self.path, &self.ack_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        *status = next;
        Ok(())
    }

    /// Reads back every valid record and every ack.
    pub(crate) fn replay(&self) -> QueueResult<Replay> {
        let records_guard = self.records.lock();
        let mut reader = RecordReader::new(&**records_guard)?;
        let records = reader.by_ref().collect::<QueueResult<Vec<_>>>()?;
        let torn_at = reader.torn_at();
        drop(records_guard);

        let acks_guard = self.acks.lock();
        let mut ack_reader = RecordReader::new(&**acks_guard)?;
        let acked = ack_reader
            .by_ref()
            .map(|r| r.map(|record| record.sequence_id))
            .collect::<QueueResult<HashSet<_>>>()?;
        if let Some(offset) = ack_reader.torn_at() {
            warn!(journal = %self.id, offset, "ignoring torn ack record");
        }

        Ok(Replay {
            records,
            acked,
            torn_at,
        })
    }

    /// Reads the record file, failing on a torn tail.
    #[cfg(test)]
    pub(crate) fn read_all(&self) -> QueueResult<Vec<Record>> {
        let records = self.records.lock();
        crate::journal::record::read_complete(&**records, &self.path)
    }
}

/// Birth time where the filesystem records one, else the last write.
fn file_created_at(path: &Path) -> QueueResult<SystemTime> {
    let metadata = fs::metadata(path)?;
    Ok(metadata.created().or_else(|_| metadata.modified())?)
}

impl std::fmt::Debug for JournalFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
