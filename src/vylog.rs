//! Module `vylog` implement the top level metadata-log type.
//!
//! One [Vylog] value owns the log directory, the journal writer thread,
//! the background I/O worker, and the append buffer. A single exclusive
//! latch protects the append buffer, the pending-row FIFO and the
//! checkpoint set, `tx_begin()` hands the latch out embedded in a [Txn]
//! value and commit gives it back.

use log::{debug, warn};

use std::{
    ffi, fs, io, path,
    sync::{
        atomic::{AtomicI64, Ordering::SeqCst},
        Mutex, MutexGuard,
    },
};

use crate::{
    checkpoint::CheckpointSet,
    files,
    journal::{IoWorker, Journal},
    record::Record,
    recovery::Recovery,
    vclock::Vclock,
    Error, Result,
};

struct LogState {
    // checkpoints known to the log, including those whose file has not
    // materialized yet.
    checkpoints: CheckpointSet,
    // checkpoint the current log file belongs to.
    last_checkpoint: Vclock,
    // set between begin_recovery() and end_recovery(). While set, commits
    // keep records buffered instead of flushing them.
    recovering: bool,
    // encoded rows awaiting to be written to disk, FIFO order.
    tx: Vec<Vec<u8>>,
    // set when a write failed to encode, surfaces on commit.
    tx_failed: Option<Error>,
}

/// Metadata log for an LSM based storage engine.
///
/// Refer to the [package documentation](crate) for an overview.
pub struct Vylog {
    dir: ffi::OsString,
    journal: Journal,
    io: IoWorker,
    inner: Mutex<LogState>,
    next_id: AtomicI64,
}

impl Vylog {
    /// Initialize the metadata log under directory `dir`. This spawns the
    /// journal writer and the I/O worker, it does not touch the disk,
    /// follow up with `bootstrap()` or `begin_recovery()`.
    pub fn init(dir: &ffi::OsStr) -> Result<Vylog> {
        let name = match path::Path::new(dir).file_name() {
            Some(name) => name.to_string_lossy().to_string(),
            None => return err_at!(InvalidFile, msg: "{:?}", dir),
        };
        let inner = LogState {
            checkpoints: CheckpointSet::new(),
            last_checkpoint: Vclock::new(),
            recovering: false,
            tx: vec![],
            tx_failed: None,
        };
        let val = Vylog {
            dir: dir.to_os_string(),
            journal: Journal::init(&name)?,
            io: IoWorker::init(&name)?,
            inner: Mutex::new(inner),
            next_id: AtomicI64::new(0),
        };
        Ok(val)
    }

    /// Close the metadata log, shutting down the journal writer and the
    /// I/O worker. Pending records that were never committed are lost.
    pub fn close(self) -> Result<()> {
        self.journal.close()?;
        self.io.close()
    }

    /// Bootstrap a fresh install. The log directory must not hold any log
    /// file, the empty vector-clock is registered as the initial
    /// checkpoint.
    pub fn bootstrap(&self) -> Result<()> {
        let mut inner = err_at!(Fatal, self.inner.lock())?;

        fs::create_dir_all(&self.dir).ok();
        let signatures = files::scan_dir(&self.dir)?;
        if !signatures.is_empty() {
            return err_at!(InvalidFile, msg: "log directory {:?} is not empty", self.dir);
        }
        inner.checkpoints.add(Vclock::new());
        inner.last_checkpoint = Vclock::new();
        Ok(())
    }

    /// Open the log file for the current checkpoint, creating it if
    /// missing. Appends do this lazily, calling it eagerly pins the
    /// initial `0.vylog` right after bootstrap.
    pub fn open(&self) -> Result<()> {
        let inner = err_at!(Fatal, self.inner.lock())?;
        let path = files::to_log_path(&self.dir, inner.last_checkpoint.to_signature());
        self.journal.open(&path)
    }

    /// Allocate a unique id for an LSM object, range, run or slice.
    /// Callable while a transaction is open.
    pub fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, SeqCst)
    }
}

impl Vylog {
    /// Prepare the log for recovery from the file matching checkpoint
    /// `vclock` and return the recovery graph.
    ///
    /// Until `end_recovery()` is called, committed transactions stay in
    /// the append buffer. Fails with [Error::MissingSnapshot] when the
    /// log on disk is newer than the caller's checkpoint, which means a
    /// stale snapshot was removed under the engine.
    pub fn begin_recovery(&self, vclock: &Vclock) -> Result<Recovery> {
        let mut inner = err_at!(Fatal, self.inner.lock())?;
        if inner.recovering {
            return err_at!(Fatal, msg: "recovery already in progress");
        }

        // tolerate a missing directory, the engine might not have used
        // the LSM at all. Complain only on an attempt to write.
        let signatures = match files::scan_dir(&self.dir) {
            Ok(signatures) => signatures,
            Err(Error::IOError(_, _)) => vec![],
            Err(err) => return Err(err),
        };
        for signature in signatures.iter() {
            inner.checkpoints.add_signature(*signature)
        }

        let last = signatures.last().copied().unwrap_or(0);
        if last > vclock.to_signature() {
            return err_at!(
                MissingSnapshot,
                msg: "log signature {} newer than checkpoint {}", last, vclock.to_signature()
            );
        }

        let path = files::to_log_path(&self.dir, last);
        let recovery = self.io.load(&path, false)?;

        self.next_id.store(recovery.to_max_id() + 1, SeqCst);
        inner.recovering = true;
        inner.last_checkpoint = vclock.clone();
        debug!(target: "vylog", "begin recovery from signature {}", last);
        Ok(recovery)
    }

    /// Finish recovery. Records buffered while recovery was in progress,
    /// typically coming from replayed WAL statements, are flushed now.
    ///
    /// When recovering from a backup the log on disk lags the active
    /// checkpoint, in that case a log file for the active signature is
    /// materialized from `recovery` first, and the buffered records are
    /// appended after its snapshot prefix.
    pub fn end_recovery(&self, recovery: &Recovery) -> Result<()> {
        let mut inner = err_at!(Fatal, self.inner.lock())?;
        if !inner.recovering {
            return err_at!(Fatal, msg: "recovery not in progress");
        }

        let signature = inner.last_checkpoint.to_signature();
        if inner.checkpoints.last_signature() != Some(signature) {
            let path = files::to_log_path(&self.dir, signature);
            self.io.save(&path, Box::new(recovery.clone()))?;
            let vclock = inner.last_checkpoint.clone();
            inner.checkpoints.add(vclock);
        }

        self.flush_locked(&mut inner)?;
        inner.recovering = false;
        debug!(target: "vylog", "end recovery at signature {}", signature);
        Ok(())
    }

    /// Create a recovery graph from the log file of the checkpoint with
    /// `signature`. If `only_checkpoint` is set, records appended after
    /// the checkpoint are not loaded, giving a consistent view of the LSM
    /// at the time of the checkpoint.
    pub fn to_recovery(&self, signature: i64, only_checkpoint: bool) -> Result<Recovery> {
        let mut inner = err_at!(Fatal, self.inner.lock())?;
        // pending records must be readable by the replay.
        if !inner.recovering {
            self.flush_locked(&mut inner)?;
        }
        let path = files::to_log_path(&self.dir, signature);
        self.io.load(&path, only_checkpoint)
    }
}

impl Vylog {
    /// Begin a transaction. The returned [Txn] value holds the append
    /// latch, locking out concurrent writers, until it is committed or
    /// dropped. Dropping an uncommitted transaction rolls it back.
    pub fn tx_begin(&self) -> Result<Txn> {
        let mut guard = err_at!(Fatal, self.inner.lock())?;
        guard.tx_failed = None;
        let svp = guard.tx.len();
        debug!(target: "vylog", "begin vylog transaction");
        Ok(Txn { log: self, svp, done: false, guard })
    }

    /// Rotate the metadata log. Creates a new log file for checkpoint
    /// `vclock` holding records required to recover active indexes, and
    /// discards records cancelling each other as well as records left
    /// from dropped indexes. This is how the log stays bounded.
    pub fn rotate(&self, vclock: &Vclock) -> Result<()> {
        let mut inner = err_at!(Fatal, self.inner.lock())?;
        if inner.recovering {
            return err_at!(Fatal, msg: "rotation during recovery");
        }

        let signature = vclock.to_signature();
        let prev_signature = inner.last_checkpoint.to_signature();
        // right after bootstrap old and new signatures coincide.
        if signature == prev_signature {
            return Ok(());
        }
        if signature < prev_signature {
            return err_at!(
                Fatal, msg: "rotation to older checkpoint {} {}", signature, prev_signature
            );
        }

        debug!(target: "vylog", "rotating vylog {} => {}", prev_signature, signature);

        // pending records must reach the old file before the snapshot is
        // taken off it.
        self.flush_locked(&mut inner)?;

        let recovery = {
            let path = files::to_log_path(&self.dir, prev_signature);
            self.io.load(&path, false)?
        };
        let path = files::to_log_path(&self.dir, signature);
        self.io.save(&path, Box::new(recovery))?;

        // the old file closes now, the new one opens on the next append.
        self.journal.rotate()?;
        inner.last_checkpoint = vclock.clone();
        inner.checkpoints.add(vclock.clone());

        debug!(target: "vylog", "done rotating vylog {}", signature);
        Ok(())
    }

    /// Remove log files that are not needed to recover from the
    /// checkpoint with `signature` or newer. The file of the previous
    /// checkpoint is always kept, backups need it.
    pub fn collect_garbage(&self, signature: i64) -> Result<()> {
        let mut inner = err_at!(Fatal, self.inner.lock())?;
        let prev_signature = match inner.checkpoints.prev_signature(signature) {
            Some(prev_signature) => prev_signature,
            None => return Ok(()),
        };
        for old in inner.checkpoints.remove_below(prev_signature) {
            let path = files::to_log_path(&self.dir, old);
            match fs::remove_file(&path) {
                Ok(()) => debug!(target: "vylog", "collected log file {:?}", path),
                Err(err) if err.kind() == io::ErrorKind::NotFound => (),
                Err(err) => warn!(target: "vylog", "failed to remove {:?}: {}", path, err),
            }
        }
        Ok(())
    }

    /// Return the path of the log file that needs to be backed up in
    /// order to recover to checkpoint `vclock`. That is the previous
    /// checkpoint's file, it contains exactly the records committed at
    /// `vclock`, without post-checkpoint additions. Returns `None` when
    /// no such file exists.
    pub fn backup_path(&self, vclock: &Vclock) -> Result<Option<ffi::OsString>> {
        let inner = err_at!(Fatal, self.inner.lock())?;
        let prev_signature = match inner.checkpoints.prev_signature(vclock.to_signature()) {
            Some(prev_signature) => prev_signature,
            None => return Ok(None),
        };
        let path = files::to_log_path(&self.dir, prev_signature);
        if path::Path::new(&path).exists() {
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }
}

impl Vylog {
    // Flush the append buffer as a single journal batch. The whole buffer
    // goes as one unit, boundaries of retried transactions are not
    // tracked and a partial write must never happen.
    fn flush_locked(&self, inner: &mut LogState) -> Result<()> {
        if inner.tx.is_empty() {
            return Ok(());
        }
        let path = files::to_log_path(&self.dir, inner.last_checkpoint.to_signature());
        self.journal.append(&path, inner.tx.clone())?;
        inner.tx.clear();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn inject_flush_error(&self, fail: bool) {
        self.journal.inject_flush_error(fail)
    }
}

/// An open transaction on the metadata log.
///
/// Records written to the transaction are buffered, in order, and reach
/// the journal as one atomic batch on `commit()`. The transaction holds
/// the log's append latch for its entire lifetime.
pub struct Txn<'a> {
    log: &'a Vylog,
    svp: usize,
    done: bool,
    guard: MutexGuard<'a, LogState>,
}

impl<'a> Drop for Txn<'a> {
    fn drop(&mut self) {
        if !self.done {
            self.rollback()
        }
    }
}

impl<'a> Txn<'a> {
    /// Buffer `record` into the transaction. Encoding failures are
    /// remembered and surface on `commit()`, keeping call sites
    /// uncluttered, a failed record is never half-buffered.
    pub fn write(&mut self, record: &Record) {
        if self.guard.tx_failed.is_some() {
            return;
        }
        debug!(target: "vylog", "write vylog record {}", record);
        match record.encode() {
            Ok(row) => self.guard.tx.push(row),
            Err(err) => self.guard.tx_failed = Some(err),
        }
    }

    /// Commit the transaction, flushing all buffered records to disk as
    /// one batch. On failure the transaction's records are discarded and
    /// no partial state is visible to future recoveries. Committing an
    /// empty transaction is a successful no-op.
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        if let Some(err) = self.guard.tx_failed.take() {
            self.rollback();
            return Err(err);
        }
        // during recovery the log file is not open for appending yet,
        // leave records in the buffer to be flushed on end of recovery.
        if self.guard.recovering {
            debug!(target: "vylog", "commit vylog transaction (recovery)");
            return Ok(());
        }
        match self.log.flush_locked(&mut self.guard) {
            Ok(()) => {
                debug!(target: "vylog", "commit vylog transaction");
                Ok(())
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    /// Commit the transaction without discarding it on flush failure,
    /// records stay buffered and the next commit retries to write them.
    /// Callers treat this as infallible.
    ///
    /// Panics when a record failed to encode, a non-discardable
    /// transaction cannot recover from that.
    pub fn try_commit(mut self) {
        self.done = true;
        if let Some(err) = self.guard.tx_failed.take() {
            panic!("non-discardable vylog transaction failed: {}", err);
        }
        if self.guard.recovering {
            debug!(target: "vylog", "commit vylog transaction (recovery)");
            return;
        }
        match self.log.flush_locked(&mut self.guard) {
            Ok(()) => debug!(target: "vylog", "commit vylog transaction"),
            Err(err) => warn!(target: "vylog", "failed to flush vylog: {}", err),
        }
    }

    fn rollback(&mut self) {
        let svp = self.svp;
        self.guard.tx.truncate(svp);
        debug!(target: "vylog", "rollback vylog transaction");
    }
}

#[cfg(test)]
#[path = "vylog_test.rs"]
mod vylog_test;
