//! Journal recovery scan.

use crate::dir::QueueDir;
use crate::error::QueueResult;
use crate::journal::file::JournalFile;
use crate::journal::record::encoded_len;
use crate::types::{Entry, JournalFileId, SequenceId};
use fpq_storage::BackendFactory;
use std::sync::Arc;
use tracing::warn;

/// What the scan found.
pub(crate) struct Recovered {
    /// Journal files present at open, oldest first, all sealed.
    pub(crate) files: Vec<Arc<JournalFile>>,
    /// Unconsumed entries in sequence order.
    pub(crate) entries: Vec<Entry>,
    /// First sequence id the new process may assign.
    pub(crate) next_sequence: SequenceId,
    /// Id for the new current file.
    pub(crate) next_file_id: JournalFileId,
}

/// Scans every journal file in id order.
///
/// Each file is streamed up to its first torn record. Records whose sequence
/// id appears in the file's ack sidecar were consumed before the restart and
/// are dropped; the rest come back for replay and the file's counters are
/// rebuilt from them.
///
/// The next sequence id starts after both the highest id still on disk and
/// the directory's high-water mark, which covers files already deleted.
pub(crate) fn recover(dir: &QueueDir, backends: &dyn BackendFactory) -> QueueResult<Recovered> {
    let ids = dir.list_journals()?;
    let mut files = Vec::with_capacity(ids.len());
    let mut entries = Vec::new();
    let mut max_sequence = 0;

    for &id in &ids {
        let file = JournalFile::open_existing(dir, id, backends)?;
        let replay = file.replay()?;
        if let Some(offset) = replay.torn_at {
            warn!(journal = %id, offset, "ignoring torn record at end of journal file");
        }

        let written = replay.records.len() as u64;
        let valid_len = replay
            .records
            .last()
            .map_or(0, |r| r.offset + encoded_len(r.payload.len()) as u64);

        let mut unconsumed = 0;
        for record in replay.records {
            max_sequence = max_sequence.max(record.sequence_id.as_u64());
            if replay.acked.contains(&record.sequence_id) {
                continue;
            }
            unconsumed += 1;
            entries.push(Entry::new(record.sequence_id, id, record.payload));
        }

        file.restore_counts(valid_len, written, unconsumed);
        files.push(Arc::new(file));
    }

    let next_file_id = ids.last().map_or(JournalFileId::new(1), |id| id.next());
    let mark = dir.load_sequence_mark()?.unwrap_or(SequenceId::new(1));
    Ok(Recovered {
        files,
        entries,
        next_sequence: mark.max(SequenceId::new(max_sequence + 1)),
        next_file_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::file::JournalFileStatus;
    use crate::journal::record::{encode_ack, encode_record};
    use std::fs::OpenOptions;
    use fpq_storage::FileBackendFactory;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_journal(dir: &QueueDir, id: u64, seqs: &[u64], acked: &[u64]) {
        let id = JournalFileId::new(id);
        let file = JournalFile::create(dir, id, &FileBackendFactory).unwrap();
        let mut buf = Vec::new();
        for &seq in seqs {
            encode_record(&mut buf, SequenceId::new(seq), format!("e{seq}").as_bytes()).unwrap();
        }
        file.append_records(&buf, seqs.len() as u64).unwrap();

        let mut acks = Vec::new();
        for &seq in acked {
            encode_ack(&mut acks, SequenceId::new(seq));
        }
        file.append_acks(&acks).unwrap();
        file.sync().unwrap();
    }

    #[test]
    fn empty_directory() {
        let tmp = tempdir().unwrap();
        let dir = QueueDir::open(tmp.path()).unwrap();

        let recovered = recover(&dir, &FileBackendFactory).unwrap();
        assert!(recovered.files.is_empty());
        assert!(recovered.entries.is_empty());
        assert_eq!(recovered.next_sequence, SequenceId::new(1));
        assert_eq!(recovered.next_file_id, JournalFileId::new(1));
    }

    #[test]
    fn acked_entries_are_dropped() {
        let tmp = tempdir().unwrap();
        let dir = QueueDir::open(tmp.path()).unwrap();
        write_journal(&dir, 1, &[1, 2, 3], &[1, 2, 3]);
        write_journal(&dir, 2, &[4, 5, 6], &[4]);

        let recovered = recover(&dir, &FileBackendFactory).unwrap();
        let seqs: Vec<u64> = recovered
            .entries
            .iter()
            .map(|e| e.sequence_id().as_u64())
            .collect();
        assert_eq!(seqs, vec![5, 6]);
        assert_eq!(recovered.entries[0].payload().as_ref(), b"e5");
        assert_eq!(recovered.entries[0].journal_id(), JournalFileId::new(2));
        assert_eq!(recovered.next_sequence, SequenceId::new(7));
        assert_eq!(recovered.next_file_id, JournalFileId::new(3));

        let first = &recovered.files[0];
        assert_eq!(first.status(), JournalFileStatus::Sealed);
        assert_eq!(first.entries_unconsumed(), 0);
        assert_eq!(recovered.files[1].descriptor().entries_written, 3);
        assert_eq!(recovered.files[1].entries_unconsumed(), 2);
    }

    #[test]
    fn torn_tail_is_ignored() {
        let tmp = tempdir().unwrap();
        let dir = QueueDir::open(tmp.path()).unwrap();
        write_journal(&dir, 1, &[1, 2], &[]);

        let mut log = OpenOptions::new()
            .append(true)
            .open(dir.journal_path(JournalFileId::new(1)))
            .unwrap();
        log.write_all(&[3, 0, 0, 0, 0, 0, 0, 0, 50, 0]).unwrap();
        drop(log);

        let recovered = recover(&dir, &FileBackendFactory).unwrap();
        assert_eq!(recovered.entries.len(), 2);
        assert_eq!(recovered.next_sequence, SequenceId::new(3));
    }

    #[test]
    fn mark_covers_deleted_files() {
        let tmp = tempdir().unwrap();
        let dir = QueueDir::open(tmp.path()).unwrap();
        dir.save_sequence_mark(SequenceId::new(20)).unwrap();
        write_journal(&dir, 4, &[], &[]);

        let recovered = recover(&dir, &FileBackendFactory).unwrap();
        assert!(recovered.entries.is_empty());
        assert_eq!(recovered.next_sequence, SequenceId::new(20));
        assert_eq!(recovered.next_file_id, JournalFileId::new(5));
    }

    #[test]
    fn records_past_the_mark_win() {
        let tmp = tempdir().unwrap();
        let dir = QueueDir::open(tmp.path()).unwrap();
        dir.save_sequence_mark(SequenceId::new(3)).unwrap();
        write_journal(&dir, 2, &[3, 4, 5], &[]);

        let recovered = recover(&dir, &FileBackendFactory).unwrap();
        assert_eq!(recovered.next_sequence, SequenceId::new(6));
    }
}
