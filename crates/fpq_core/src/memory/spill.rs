//! Offloading evicted segments to disk.
//!
//! A spill file is a plain run of journal records. The owning journal file
//! of each entry is not stored per record; the handle keeps it as a list of
//! runs, which is short because consecutive entries almost always share a
//! journal file.

use crate::dir::QueueDir;
use crate::error::{QueueError, QueueResult};
use crate::journal::{encode_record, encoded_len, read_complete};
use crate::types::{Entry, JournalFileId, SegmentId};
use fpq_storage::{FileBackend, StorageBackend};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Location and shape of a spilled segment.
#[derive(Debug)]
pub struct SpillHandle {
    path: PathBuf,
    journal_runs: Vec<(JournalFileId, u64)>,
    entries: u64,
}

impl SpillHandle {
    /// Spill file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries in the file.
    #[must_use]
    pub fn entries(&self) -> u64 {
        self.entries
    }
}

/// Writes and reads spill files under the queue's `segments/` directory.
#[derive(Debug)]
pub(crate) struct SpillStore {
    dir: Arc<QueueDir>,
}

impl SpillStore {
    pub(crate) fn new(dir: Arc<QueueDir>) -> Self {
        Self { dir }
    }

    /// Writes `entries` to a new spill file for segment `id`.
    pub(crate) fn save(&self, id: SegmentId, entries: &[Entry]) -> QueueResult<SpillHandle> {
        let path = self.dir.spill_path(id);

        let mut buf = Vec::with_capacity(
            entries
                .iter()
                .map(|e| encoded_len(e.payload().len()))
                .sum(),
        );
        let mut journal_runs: Vec<(JournalFileId, u64)> = Vec::new();
        for entry in entries {
            encode_record(&mut buf, entry.sequence_id(), entry.payload())?;
            match journal_runs.last_mut() {
                Some((journal, count)) if *journal == entry.journal_id() => *count += 1,
                _ => journal_runs.push((entry.journal_id(), 1)),
            }
        }

        let mut backend = FileBackend::create_new(&path)?;
        if let Err(e) = backend.append(&buf).and_then(|_| backend.flush()) {
            backend.close();
            remove_quietly(&path);
            return Err(e.into());
        }

        Ok(SpillHandle {
            path,
            journal_runs,
            entries: entries.len() as u64,
        })
    }

    /// Reads a spilled segment back. The file is left in place.
    pub(crate) fn load(&self, handle: &SpillHandle) -> QueueResult<Vec<Entry>> {
        let backend = FileBackend::open(&handle.path)?;
        let records = read_complete(&backend, &handle.path)?;
        if records.len() as u64 != handle.entries {
            return Err(QueueError::corrupt_record(
                &handle.path,
                0,
                format!(
                    "spill file holds {} records, expected {}",
                    records.len(),
                    handle.entries
                ),
            ));
        }

        let journals = handle
            .journal_runs
            .iter()
            .flat_map(|&(journal, count)| (0..count).map(move |_| journal));
        Ok(records
            .into_iter()
            .zip(journals)
            .map(|(record, journal)| Entry::new(record.sequence_id, journal, record.payload))
            .collect())
    }

    /// Removes a spill file that is no longer needed.
    pub(crate) fn discard(&self, handle: SpillHandle) {
        remove_quietly(&handle.path);
    }
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove spill file"),
    }
}
