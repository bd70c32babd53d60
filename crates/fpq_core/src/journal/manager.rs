//! Journal manager: the append path, file rolling, background fsync and
//! deletion of drained files.

use crate::config::Config;
use crate::dir::QueueDir;
use crate::error::{QueueError, QueueResult};
use crate::journal::file::{JournalFile, JournalFileDescriptor};
use crate::journal::record::{encode_ack, encode_record, encoded_len, RECORD_HEADER_SIZE};
use crate::journal::recovery;
use crate::stats::QueueStats;
use crate::types::{Entry, JournalFileId, SequenceId};
use crate::worker::StopSignal;
use bytes::Bytes;
use fpq_storage::BackendFactory;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// State guarded by the append lock.
struct Writer {
    current: Arc<JournalFile>,
    next_sequence: SequenceId,
}

/// State shared with the background threads.
struct JournalShared {
    dir: Arc<QueueDir>,
    backends: Arc<dyn BackendFactory>,
    max_file_size: u64,
    max_file_age: Duration,
    flush_period: Duration,
    writer: Mutex<Writer>,
    files: RwLock<BTreeMap<JournalFileId, Arc<JournalFile>>>,
    stats: Arc<QueueStats>,
    stop: StopSignal,
    closed: AtomicBool,
}

impl JournalShared {
    /// Syncs every dirty file selected by `assigned` and returns the
    /// failures. A failed file stays dirty for the next attempt.
    fn sync_files(
        &self,
        assigned: impl Fn(JournalFileId) -> bool,
    ) -> Vec<(JournalFileId, QueueError)> {
        let files: Vec<_> = self
            .files
            .read()
            .values()
            .filter(|f| assigned(f.id()))
            .cloned()
            .collect();

        let mut failures = Vec::new();
        for file in files {
            match file.sync() {
                Ok(true) => self.stats.record_flush(true),
                Ok(false) => {}
                Err(e) => {
                    self.stats.record_flush(false);
                    failures.push((file.id(), e));
                }
            }
        }
        failures
    }
}

/// Owns the journal files of one queue directory.
///
/// Appends go to the single current file under one lock. A file is sealed
/// and replaced once it reaches the size or age limit, and deleted by the
/// reaper thread once every entry in it has been reported consumed. Flush
/// workers fsync dirty files every flush period; `append` itself never
/// fsyncs.
pub struct JournalManager {
    shared: Arc<JournalShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    reaper_tx: Mutex<Option<Sender<Arc<JournalFile>>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl JournalManager {
    /// Opens the journal in `dir`, recovering whatever a previous process
    /// left behind.
    ///
    /// Returns the manager and the unconsumed entries, in sequence order.
    /// Every recovered file is sealed; a fresh current file is created. The
    /// sequence high-water mark is persisted before any recovered file can
    /// be deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be scanned, a file cannot be
    /// opened, or a background thread cannot be started.
    pub fn open(
        dir: Arc<QueueDir>,
        config: &Config,
        stats: Arc<QueueStats>,
        backends: Arc<dyn BackendFactory>,
    ) -> QueueResult<(Self, Vec<Entry>)> {
        let recovered = recovery::recover(&dir, &*backends)?;
        dir.save_sequence_mark(recovered.next_sequence)?;

        let current = Arc::new(JournalFile::create(
            &dir,
            recovered.next_file_id,
            &*backends,
        )?);
        stats.record_journal_created();
        stats.record_recovered(recovered.entries.len() as u64);

        let mut files = BTreeMap::new();
        for file in &recovered.files {
            files.insert(file.id(), Arc::clone(file));
        }
        files.insert(current.id(), Arc::clone(&current));

        let shared = Arc::new(JournalShared {
            dir,
            backends,
            max_file_size: config.max_journal_file_size_bytes,
            max_file_age: config.max_journal_duration(),
            flush_period: config.flush_period(),
            writer: Mutex::new(Writer {
                current,
                next_sequence: recovered.next_sequence,
            }),
            files: RwLock::new(files),
            stats,
            stop: StopSignal::new(),
            closed: AtomicBool::new(false),
        });

        let (tx, rx) = mpsc::channel();
        let reaper = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("fpq-journal-reaper".into())
                .spawn(move || run_reaper(&shared, rx))?
        };

        let manager = Self {
            shared,
            workers: Mutex::new(Vec::new()),
            reaper_tx: Mutex::new(Some(tx)),
            reaper: Mutex::new(Some(reaper)),
        };

        let worker_count = u64::from(config.number_of_flush_workers);
        for index in 0..worker_count {
            let shared = Arc::clone(&manager.shared);
            let handle = thread::Builder::new()
                .name(format!("fpq-flush-{index}"))
                .spawn(move || run_flush_worker(&shared, index, worker_count))?;
            manager.workers.lock().push(handle);
        }

        for file in &recovered.files {
            if file.try_begin_delete() {
                manager.schedule_delete(Arc::clone(file));
            }
        }

        info!(
            dir = %manager.shared.dir.path().display(),
            files = recovered.files.len(),
            entries = recovered.entries.len(),
            next_sequence = %recovered.next_sequence,
            "journal opened"
        );
        Ok((manager, recovered.entries))
    }

    /// Appends `payloads` to the current file.
    ///
    /// Sequence ids are assigned consecutively in slice order. The records
    /// are written with one append but not fsynced; they become durable on
    /// the next flush tick or [`Self::flush`].
    ///
    /// # Errors
    ///
    /// Returns the storage error if the write fails. No sequence id is
    /// consumed and no counter moves in that case.
    pub fn append(&self, payloads: &[Bytes]) -> QueueResult<Vec<Entry>> {
        self.ensure_open()?;
        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        let mut writer = self.shared.writer.lock();
        let file = Arc::clone(&writer.current);
        let first = writer.next_sequence;

        let mut buf = Vec::with_capacity(payloads.iter().map(|p| encoded_len(p.len())).sum());
        let mut sequence = first;
        for payload in payloads {
            encode_record(&mut buf, sequence, payload)?;
            sequence = sequence.next();
        }

        file.append_records(&buf, payloads.len() as u64)?;
        writer.next_sequence = sequence;
        self.shared.stats.record_journaled_bytes(buf.len() as u64);

        let entries = payloads
            .iter()
            .zip(first.as_u64()..)
            .map(|(payload, seq)| Entry::new(SequenceId::new(seq), file.id(), payload.clone()))
            .collect();

        if file.should_roll(self.shared.max_file_size, self.shared.max_file_age) {
            if let Err(e) = self.roll(&mut writer) {
                warn!(journal = %file.id(), error = %e, "journal roll failed, appending to the full file");
            }
        }
        Ok(entries)
    }

    /// Seals the current file and starts the next one.
    ///
    /// The high-water mark is saved first: once sealed, the file may be
    /// deleted and its ids must not come back at the next open.
    fn roll(&self, writer: &mut Writer) -> QueueResult<()> {
        self.shared.dir.save_sequence_mark(writer.next_sequence)?;
        let next_id = writer.current.id().next();
        let next = Arc::new(JournalFile::create(
            &self.shared.dir,
            next_id,
            &*self.shared.backends,
        )?);
        writer.current.seal()?;

        self.shared.files.write().insert(next_id, Arc::clone(&next));
        let sealed = std::mem::replace(&mut writer.current, next);
        self.shared.stats.record_journal_created();

        let desc = sealed.descriptor();
        debug!(
            sealed = %desc.id,
            size_bytes = desc.size_bytes,
            entries = desc.entries_written,
            next = %next_id,
            "journal rolled"
        );

        if sealed.try_begin_delete() {
            self.schedule_delete(sealed);
        }
        Ok(())
    }

    /// Records `entries` as consumed.
    ///
    /// One ack per entry is written to the owning file's sidecar before any
    /// counter moves; if a sidecar write fails, acks already written for
    /// this call are reverted and nothing is counted. A sealed file that
    /// reaches zero unconsumed entries is handed to the reaper.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidState`] for entries of an unknown file
    /// or more entries than a file has outstanding, or the storage error of
    /// a failed ack write.
    pub fn report_consumed(&self, entries: &[Entry]) -> QueueResult<()> {
        self.ensure_open()?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut groups: BTreeMap<JournalFileId, Vec<SequenceId>> = BTreeMap::new();
        for entry in entries {
            groups
                .entry(entry.journal_id())
                .or_default()
                .push(entry.sequence_id());
        }

        let mut resolved = Vec::with_capacity(groups.len());
        {
            let files = self.shared.files.read();
            for (id, sequences) in groups {
                let file = files.get(&id).cloned().ok_or_else(|| {
                    QueueError::invalid_state(format!("consumed entries reference unknown {id}"))
                })?;
                file.check_consumable(sequences.len() as u64)?;
                resolved.push((file, sequences));
            }
        }

        let mut written: Vec<(&JournalFile, u64)> = Vec::with_capacity(resolved.len());
        for (file, sequences) in &resolved {
            let mut buf = Vec::with_capacity(sequences.len() * RECORD_HEADER_SIZE);
            for &sequence in sequences {
                encode_ack(&mut buf, sequence);
            }
            match file.append_acks(&buf) {
                Ok(before) => written.push((&**file, before)),
                Err(e) => {
                    for (done, before) in written {
                        done.revert_acks(before);
                    }
                    return Err(e);
                }
            }
        }

        for (file, sequences) in resolved {
            if file.consume(sequences.len() as u64) == 0 && file.try_begin_delete() {
                self.schedule_delete(file);
            }
        }
        Ok(())
    }

    fn schedule_delete(&self, file: Arc<JournalFile>) {
        let id = file.id();
        match self.reaper_tx.lock().as_ref() {
            Some(tx) => {
                if tx.send(file).is_err() {
                    warn!(journal = %id, "journal reaper is gone, drained file stays on disk");
                }
            }
            None => debug!(journal = %id, "journal closed, drained file left for the next open"),
        }
    }

    /// Fsyncs every dirty journal file.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] after shutdown, or the first sync
    /// failure after every file has been attempted.
    pub fn flush(&self) -> QueueResult<()> {
        self.ensure_open()?;
        match self.shared.sync_files(|_| true).into_iter().next() {
            Some((_, e)) => Err(e),
            None => Ok(()),
        }
    }

    /// Stops the flush workers, fsyncs every file one last time, saves the
    /// sequence high-water mark and stops the reaper after it has drained
    /// its queue. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the first failure of the final flush or of saving the mark.
    pub fn shutdown(&self) -> QueueResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shared.stop.stop();
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                error!("journal flush worker panicked");
            }
        }

        let failures = self.shared.sync_files(|_| true);
        for (id, e) in &failures {
            error!(journal = %id, error = %e, "final journal flush failed");
        }
        let next_sequence = self.shared.writer.lock().next_sequence;
        let marked = self.shared.dir.save_sequence_mark(next_sequence);
        if let Err(e) = &marked {
            error!(next_sequence = %next_sequence, error = %e, "failed to save sequence mark");
        }

        drop(self.reaper_tx.lock().take());
        if let Some(handle) = self.reaper.lock().take() {
            if handle.join().is_err() {
                error!("journal reaper panicked");
            }
        }

        info!(dir = %self.shared.dir.path().display(), "journal closed");
        match failures.into_iter().next() {
            Some((_, e)) => Err(e),
            None => marked,
        }
    }

    /// True once [`Self::shutdown`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.is_closed() {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    /// Describes every live journal file, oldest first.
    #[must_use]
    pub fn files(&self) -> Vec<JournalFileDescriptor> {
        self.shared
            .files
            .read()
            .values()
            .map(|f| f.descriptor())
            .collect()
    }

    /// Describes the file receiving appends.
    #[must_use]
    pub fn current_file(&self) -> JournalFileDescriptor {
        self.shared.writer.lock().current.descriptor()
    }

    /// Sequence id the next append will start at.
    #[must_use]
    pub fn next_sequence(&self) -> SequenceId {
        self.shared.writer.lock().next_sequence
    }
}

impl std::fmt::Debug for JournalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalManager")
            .field("dir", &self.shared.dir.path())
            .field("files", &self.shared.files.read().len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for JournalManager {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn run_flush_worker(shared: &JournalShared, index: u64, workers: u64) {
    while !shared.stop.wait(shared.flush_period) {
        for (id, e) in shared.sync_files(|id| id.as_u64() % workers == index) {
            error!(journal = %id, worker = index, error = %e, "journal flush failed");
        }
    }
}

fn run_reaper(shared: &JournalShared, rx: Receiver<Arc<JournalFile>>) {
    for file in rx {
        let id = file.id();
        match file.remove() {
            Ok(()) => {
                shared.files.write().remove(&id);
                shared.stats.record_journal_removed();
                debug!(journal = %id, "drained journal file removed");
            }
            Err(e) => error!(journal = %id, error = %e, "failed to remove drained journal file"),
        }
    }
}
