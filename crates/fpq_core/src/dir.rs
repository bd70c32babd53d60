//! Journal directory management.
//!
//! ```text
//! <journal_directory>/
//! ├─ LOCK                                # advisory lock, one owning process
//! ├─ SEQUENCE                            # sequence id high-water mark
//! ├─ journal-00000000000000000001.log    # appended records
//! ├─ journal-00000000000000000001.ack    # consumption acks for that file
//! └─ segments/                           # spill files of evicted segments
//!    └─ <segment uuid>.spill
//! ```

use crate::error::{QueueError, QueueResult};
use crate::types::{JournalFileId, SegmentId, SequenceId};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const SEQUENCE_FILE: &str = "SEQUENCE";
const SEQUENCE_TEMP: &str = "SEQUENCE.tmp";
const JOURNAL_PREFIX: &str = "journal-";
const JOURNAL_EXT: &str = "log";
const ACK_EXT: &str = "ack";
const SEGMENTS_DIR: &str = "segments";
const SPILL_EXT: &str = "spill";

/// Owns a journal directory for the lifetime of a queue.
///
/// Holds an exclusive lock on `LOCK`; a second queue opened on the same
/// directory, from this process or another one, fails with
/// [`QueueError::QueueLocked`].
#[derive(Debug)]
pub struct QueueDir {
    path: PathBuf,
    _lock_file: File,
}

impl QueueDir {
    /// Opens (creating if needed) and locks a journal directory.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Configuration`] if the path exists but is not a
    /// directory, [`QueueError::QueueLocked`] if another owner holds it, or
    /// an I/O error.
    pub fn open(path: &Path) -> QueueResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(QueueError::configuration(format!(
                "journal_directory is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(QueueError::QueueLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the record file for a journal.
    #[must_use]
    pub fn journal_path(&self, id: JournalFileId) -> PathBuf {
        self.path
            .join(format!("{JOURNAL_PREFIX}{:020}.{JOURNAL_EXT}", id.as_u64()))
    }

    /// Path of the ack sidecar for a journal.
    #[must_use]
    pub fn ack_path(&self, id: JournalFileId) -> PathBuf {
        self.path
            .join(format!("{JOURNAL_PREFIX}{:020}.{ACK_EXT}", id.as_u64()))
    }

    /// Directory holding segment spill files.
    #[must_use]
    pub fn segments_path(&self) -> PathBuf {
        self.path.join(SEGMENTS_DIR)
    }

    /// Path of the spill file for a segment.
    #[must_use]
    pub fn spill_path(&self, id: SegmentId) -> PathBuf {
        self.segments_path()
            .join(format!("{}.{SPILL_EXT}", id.as_uuid().simple()))
    }

    /// Lists the journal files present, oldest first.
    ///
    /// Ack sidecars without a record file are ignored; they belong to a
    /// journal whose deletion was interrupted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn list_journals(&self) -> QueueResult<Vec<JournalFileId>> {
        let mut ids = Vec::new();
        for dir_entry in fs::read_dir(&self.path)? {
            let name = dir_entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(id) = parse_journal_name(name) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Removes ack sidecars whose record file is gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or a file cannot be
    /// removed.
    pub fn remove_orphan_acks(&self) -> QueueResult<usize> {
        let mut removed = 0;
        for dir_entry in fs::read_dir(&self.path)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ACK_EXT) {
                continue;
            }
            if !path.with_extension(JOURNAL_EXT).exists() {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Reads the sequence high-water mark: no id below it was ever
    /// assigned to a record that may be gone from disk. `None` for a
    /// directory that never rolled a journal.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::CorruptRecord`] if the file is not exactly one
    /// id, or an I/O error.
    pub fn load_sequence_mark(&self) -> QueueResult<Option<SequenceId>> {
        let path = self.path.join(SEQUENCE_FILE);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let bytes: [u8; 8] = data.as_slice().try_into().map_err(|_| {
            QueueError::corrupt_record(&path, 0, format!("expected 8 bytes, found {}", data.len()))
        })?;
        Ok(Some(SequenceId::new(u64::from_le_bytes(bytes))))
    }

    /// Replaces the sequence high-water mark.
    ///
    /// Written to a temporary file, fsynced and renamed over the old mark,
    /// then the directory is fsynced so the rename survives a crash.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of any step; the previous mark is left intact.
    pub fn save_sequence_mark(&self, next: SequenceId) -> QueueResult<()> {
        let temp_path = self.path.join(SEQUENCE_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(&next.as_u64().to_le_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.path.join(SEQUENCE_FILE))?;
        self.sync_directory()
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> QueueResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    // NTFS journals metadata; directories cannot be fsynced there.
    #[cfg(not(unix))]
    fn sync_directory(&self) -> QueueResult<()> {
        Ok(())
    }

    /// Empties the spill directory, creating it if missing.
    ///
    /// Spill files never outlive a process: recovery rebuilds the memory
    /// queue from the journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or cleared.
    pub fn reset_segments(&self) -> QueueResult<()> {
        let segments = self.segments_path();
        if segments.exists() {
            fs::remove_dir_all(&segments)?;
        }
        fs::create_dir_all(&segments)?;
        Ok(())
    }
}

fn parse_journal_name(name: &str) -> Option<JournalFileId> {
    let digits = name
        .strip_prefix(JOURNAL_PREFIX)?
        .strip_suffix(JOURNAL_EXT)?
        .strip_suffix('.')?;
    digits.parse().ok().map(JournalFileId::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("queue");

        let dir = QueueDir::open(&path).unwrap();
        assert!(path.is_dir());
        assert!(path.join(LOCK_FILE).exists());
        assert_eq!(dir.path(), path);
    }

    #[test]
    fn second_open_is_locked() {
        let temp = tempdir().unwrap();
        let _first = QueueDir::open(temp.path()).unwrap();

        let second = QueueDir::open(temp.path());
        assert!(matches!(second, Err(QueueError::QueueLocked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        drop(QueueDir::open(temp.path()).unwrap());
        assert!(QueueDir::open(temp.path()).is_ok());
    }

    #[test]
    fn journal_names_round_trip_through_listing() {
        let temp = tempdir().unwrap();
        let dir = QueueDir::open(temp.path()).unwrap();

        for id in [3, 1, 12] {
            fs::write(dir.journal_path(JournalFileId::new(id)), b"").unwrap();
        }
        fs::write(dir.ack_path(JournalFileId::new(1)), b"").unwrap();
        fs::write(temp.path().join("journal-garbage.log"), b"").unwrap();

        let ids = dir.list_journals().unwrap();
        assert_eq!(
            ids,
            vec![
                JournalFileId::new(1),
                JournalFileId::new(3),
                JournalFileId::new(12)
            ]
        );
    }

    #[test]
    fn orphan_acks_are_removed() {
        let temp = tempdir().unwrap();
        let dir = QueueDir::open(temp.path()).unwrap();

        fs::write(dir.journal_path(JournalFileId::new(1)), b"").unwrap();
        fs::write(dir.ack_path(JournalFileId::new(1)), b"").unwrap();
        fs::write(dir.ack_path(JournalFileId::new(2)), b"").unwrap();

        assert_eq!(dir.remove_orphan_acks().unwrap(), 1);
        assert!(dir.ack_path(JournalFileId::new(1)).exists());
        assert!(!dir.ack_path(JournalFileId::new(2)).exists());
    }

    #[test]
    fn sequence_mark_survives_reopen() {
        let temp = tempdir().unwrap();
        {
            let dir = QueueDir::open(temp.path()).unwrap();
            assert_eq!(dir.load_sequence_mark().unwrap(), None);
            dir.save_sequence_mark(SequenceId::new(40)).unwrap();
            dir.save_sequence_mark(SequenceId::new(41)).unwrap();
        }

        let dir = QueueDir::open(temp.path()).unwrap();
        assert_eq!(dir.load_sequence_mark().unwrap(), Some(SequenceId::new(41)));
        assert!(!temp.path().join(SEQUENCE_TEMP).exists());
        assert!(dir.list_journals().unwrap().is_empty());
    }

    #[test]
    fn short_sequence_mark_is_corrupt() {
        let temp = tempdir().unwrap();
        let dir = QueueDir::open(temp.path()).unwrap();
        fs::write(temp.path().join(SEQUENCE_FILE), [1, 2, 3]).unwrap();

        assert!(matches!(
            dir.load_sequence_mark(),
            Err(QueueError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn reset_segments_clears_stale_spills() {
        let temp = tempdir().unwrap();
        let dir = QueueDir::open(temp.path()).unwrap();
        dir.reset_segments().unwrap();

        let stale = dir.spill_path(SegmentId::generate());
        fs::write(&stale, b"old").unwrap();

        dir.reset_segments().unwrap();
        assert!(!stale.exists());
        assert!(dir.segments_path().is_dir());
    }
}
