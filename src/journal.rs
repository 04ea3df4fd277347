//! Module `journal` implement the durable side of the metadata log.
//!
//! Two actors live here. The journal writer owns the current log file
//! and appends batches of encoded rows, each batch flushed and synced as
//! one unit, so a transaction is either fully durable or fully absent.
//! The background I/O worker replays log files into [Recovery] graphs
//! and materializes graphs into fresh log files, keeping blocking disk
//! I/O off the transaction actor. Both are [crate::worker] threads.

use log::debug;

use std::{
    ffi, fs, mem, path,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
};

use crate::{
    files,
    record::Record,
    recovery::Recovery,
    worker::{Caller, Inbox, Worker},
    Error, Result,
};

// Requests handled by the journal writer thread.
pub(crate) enum Req {
    // force the open policy for the file at `path`.
    Open { path: ffi::OsString },
    // durably append a batch of encoded rows to the file at `path`.
    Append { path: ffi::OsString, rows: Vec<Vec<u8>> },
    // close the current file, the next append re-opens at the path it
    // is asked to write, derived from the new checkpoint.
    Rotate,
}

/// Journal writer for vylog batches. A dedicated thread, so that metadata
/// flushes never contend with user-data WAL writes.
pub(crate) struct Journal {
    caller: Caller<Req, Result<()>>,
    worker: Worker<Req, Result<()>, Result<()>>,
    inject: Arc<AtomicBool>,
}

impl Journal {
    pub fn init(name: &str) -> Result<Journal> {
        let inject = Arc::new(AtomicBool::new(false));
        let worker = {
            let inject = Arc::clone(&inject);
            Worker::spawn(
                &format!("vylog-journal-{}", name),
                move |inbox: Inbox<Req, Result<()>>| {
                    move || (MainLoop { file: None, inject, inbox }).run()
                },
            )?
        };
        let caller = worker.to_caller();
        Ok(Journal { caller, worker, inject })
    }

    /// Open the log file at `path`, creating it if missing.
    pub fn open(&self, path: &ffi::OsStr) -> Result<()> {
        self.caller.call(Req::Open { path: path.to_os_string() })?
    }

    /// Append `rows` to the log file at `path` as a single durable unit.
    pub fn append(&self, path: &ffi::OsStr, rows: Vec<Vec<u8>>) -> Result<()> {
        self.caller.call(Req::Append { path: path.to_os_string(), rows })?
    }

    /// Close the current log file, if any.
    pub fn rotate(&self) -> Result<()> {
        self.caller.call(Req::Rotate)?
    }

    /// Arrange for the next appends to fail with [Error::Injected].
    pub fn inject_flush_error(&self, fail: bool) {
        self.inject.store(fail, SeqCst);
    }

    pub fn close(self) -> Result<()> {
        mem::drop(self.caller);
        self.worker.join()?
    }
}

struct MainLoop {
    file: Option<(ffi::OsString, fs::File)>,
    inject: Arc<AtomicBool>,
    inbox: Inbox<Req, Result<()>>,
}

impl MainLoop {
    fn run(mut self) -> Result<()> {
        while let Ok((req, resp_tx)) = self.inbox.recv() {
            let res = match req {
                Req::Open { path } => self.do_open(&path),
                Req::Append { path, rows } => self.do_append(&path, rows),
                Req::Rotate => {
                    self.file = None;
                    Ok(())
                }
            };
            err_at!(IPCFail, resp_tx.send(res))?
        }
        Ok(())
    }

    fn do_open(&mut self, path: &ffi::OsStr) -> Result<()> {
        match &self.file {
            Some((loc, _)) if loc == path => return Ok(()),
            Some(_) => self.file = None,
            None => (),
        }
        let file = open_log(path)?;
        debug!(target: "vylog", "journal open {:?}", path);
        self.file = Some((path.to_os_string(), file));
        Ok(())
    }

    fn do_append(&mut self, path: &ffi::OsStr, rows: Vec<Vec<u8>>) -> Result<()> {
        if self.inject.load(SeqCst) {
            return err_at!(Injected, msg: "vylog flush");
        }
        self.do_open(path)?;

        let mut data = vec![];
        for row in rows.iter() {
            data.extend_from_slice(row)
        }
        match self.file.as_mut() {
            Some((_, file)) => write_rows(file, &data),
            None => err_at!(Fatal, msg: "journal file not open {:?}", path),
        }
    }
}

// Open the log file at `path` for appending. A missing file is first
// materialized under its in-progress name, with a leading snapshot
// marker, even an empty snapshot, and renamed into place, so readers
// never observe a half-created log.
fn open_log(path: &ffi::OsStr) -> Result<fs::File> {
    if !path::Path::new(path).exists() {
        let tmp = files::to_tmp_path(path);
        let mut file = create_tmp(&tmp)?;
        write_rows(&mut file, &Record::snapshot().encode()?)?;
        err_at!(IOError, fs::rename(&tmp, path), "renaming {:?}", tmp)?;
    }
    let mut opts = fs::OpenOptions::new();
    err_at!(IOError, opts.append(true).open(path), "opening log {:?}", path)
}

// Create the in-progress file for a log being materialized, making the
// log directory on first use. A leftover from an interrupted save is
// silently replaced.
fn create_tmp(tmp: &ffi::OsStr) -> Result<fs::File> {
    fs::remove_file(tmp).ok();
    match path::Path::new(tmp).parent() {
        Some(parent) => err_at!(IOError, fs::create_dir_all(parent), "under {:?}", parent)?,
        None => return err_at!(InvalidFile, msg: "{:?}", tmp),
    };
    let mut opts = fs::OpenOptions::new();
    err_at!(IOError, opts.append(true).create_new(true).open(tmp), "creating {:?}", tmp)
}

// Write a batch of encoded rows and flush it all the way to disk. A
// short write breaks the all-or-nothing journal contract, report it as
// fatal rather than pretending the batch is durable.
fn write_rows(file: &mut fs::File, data: &[u8]) -> Result<()> {
    use std::io::Write;

    let n = err_at!(IOError, file.write(data))?;
    if n != data.len() {
        return err_at!(Fatal, msg: "partial row write {}/{}", n, data.len());
    }
    err_at!(IOError, file.sync_all())
}

// Requests handled by the background I/O worker.
pub(crate) enum IoReq {
    // replay the log file at `path` into a recovery graph.
    Load { path: ffi::OsString, only_checkpoint: bool },
    // materialize `recovery` as a fresh log file at `path`.
    Save { path: ffi::OsString, recovery: Box<Recovery> },
}

pub(crate) enum IoRes {
    Graph(Box<Recovery>),
    Done,
}

/// Background worker for synchronous file I/O, loading a log file into a
/// recovery graph and saving a graph as a new log file. The transaction
/// actor submits a request and waits, ownership of the graph crosses the
/// channel with the request.
pub(crate) struct IoWorker {
    caller: Caller<IoReq, Result<IoRes>>,
    worker: Worker<IoReq, Result<IoRes>, Result<()>>,
}

impl IoWorker {
    pub fn init(name: &str) -> Result<IoWorker> {
        let worker = Worker::spawn(
            &format!("vylog-io-{}", name),
            move |inbox: Inbox<IoReq, Result<IoRes>>| move || io_main_loop(inbox),
        )?;
        let caller = worker.to_caller();
        Ok(IoWorker { caller, worker })
    }

    pub fn load(&self, path: &ffi::OsStr, only_checkpoint: bool) -> Result<Recovery> {
        let req = IoReq::Load { path: path.to_os_string(), only_checkpoint };
        match self.caller.call(req)?? {
            IoRes::Graph(recovery) => Ok(*recovery),
            IoRes::Done => err_at!(Fatal, msg: "mismatched io response"),
        }
    }

    pub fn save(&self, path: &ffi::OsStr, recovery: Box<Recovery>) -> Result<()> {
        let req = IoReq::Save { path: path.to_os_string(), recovery };
        match self.caller.call(req)?? {
            IoRes::Done => Ok(()),
            IoRes::Graph(_) => err_at!(Fatal, msg: "mismatched io response"),
        }
    }

    pub fn close(self) -> Result<()> {
        mem::drop(self.caller);
        self.worker.join()?
    }
}

fn io_main_loop(inbox: Inbox<IoReq, Result<IoRes>>) -> Result<()> {
    while let Ok((req, resp_tx)) = inbox.recv() {
        let res = match req {
            IoReq::Load { path, only_checkpoint } => {
                Recovery::load(&path, only_checkpoint)
                    .map(|recovery| IoRes::Graph(Box::new(recovery)))
            }
            IoReq::Save { path, recovery } => {
                save_log(&path, &recovery).map(|_| IoRes::Done)
            }
        };
        err_at!(IPCFail, resp_tx.send(res))?
    }
    Ok(())
}

// Materialize a recovery graph as a fresh log file, the snapshot prefix
// followed by the end-of-snapshot marker. The file is fully written and
// synced under its in-progress name, then renamed into place. On failure
// the in-progress file is unlinked and the previous file is left intact.
pub(crate) fn save_log(path: &ffi::OsStr, recovery: &Recovery) -> Result<()> {
    let tmp = files::to_tmp_path(path);
    let res = || -> Result<()> {
        let mut file = create_tmp(&tmp)?;
        let mut data = vec![];
        recovery.iterate(|record| {
            debug!(target: "vylog", "save record {}", record);
            data.extend_from_slice(&record.encode()?);
            Ok(())
        })?;
        data.extend_from_slice(&Record::snapshot().encode()?);
        write_rows(&mut file, &data)?;
        err_at!(IOError, fs::rename(&tmp, path), "renaming {:?}", tmp)
    }();

    match res {
        Ok(()) => {
            debug!(target: "vylog", "saved log file {:?}", path);
            Ok(())
        }
        Err(err) => {
            fs::remove_file(&tmp).ok();
            Err(err)
        }
    }
}

#[cfg(test)]
#[path = "journal_test.rs"]
mod journal_test;
