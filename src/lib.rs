//! Package implement metadata logging for LSM based storage.
//!
//! An LSM engine keeps its data in ranges and runs. Runs correspond to
//! sorted data files on disk, ranges group runs, via slices, into key-space
//! partitions. Dumps and compactions replace several such objects with new
//! ones and every such structural change must be applied atomically, else
//! a crash can leave the engine unable to tell live files from garbage.
//! [Vylog] is the append-only journal recording those changes, one
//! [Record] at a time, grouped into transactions.
//!
//! A typical life-cycle falls under one of the following categories:
//!
//! * Fresh install, `Vylog::init()` followed by `Vylog::bootstrap()`.
//! * Restart, `Vylog::init()` followed by `Vylog::begin_recovery()`,
//!   replaying the [Recovery] graph into the engine, and
//!   `Vylog::end_recovery()`.
//! * Checkpoint, `Vylog::rotate()` compacting the log into a fresh file.
//! * Backup and garbage-collection, `Vylog::backup_path()` and
//!   `Vylog::collect_garbage()`.
//!
//! Transactions are composed with `tx_begin()`, which locks out concurrent
//! writers until the returned [Txn] value is committed. Records buffered
//! by a transaction are flushed as a single batch by a dedicated journal
//! thread, file materialization and replay happen on a background I/O
//! worker, so the caller never blocks on disk outside the two explicit
//! submission points.

use std::{error, fmt, result};

/// Short form to compose Error values.
///
/// Here are few possible ways:
///
/// ```ignore
/// use vylog::Error;
/// err_at!(InvalidLog, msg: "bad record")
/// ```
///
/// ```ignore
/// use vylog::Error;
/// err_at!(IOError, std::fs::read(file_path))
/// ```
///
/// ```ignore
/// use vylog::Error;
/// err_at!(IOError, std::fs::read(file_path), "reading {:?}", file_path)
/// ```
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("at {}:{}", file!(), line!());
        Err(Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("at {}:{}", file!(), line!());
                Err(Error::$v(prefix, format!("{}", err)))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("at {}:{}", file!(), line!());
                let msg = format!($($arg),+);
                Err(Error::$v(prefix, format!("{} {}", err, msg)))
            }
        }
    }};
}

mod checkpoint;
mod files;
mod journal;
mod record;
mod recovery;
mod vclock;
mod vylog;
mod worker;

pub use crate::record::{Datum, Key, KeyPart, Kind, Record};
pub use crate::recovery::{Index, Range, Recovery, Run, Slice};
pub use crate::vclock::Vclock;
pub use crate::vylog::{Txn, Vylog};

/// Type alias for Result return type, used by this package.
pub type Result<T> = result::Result<T, Error>;

/// Error variants that can be returned by this package's API.
///
/// Each variant carries a prefix, typically identifying the
/// error location.
pub enum Error {
    Fatal(String, String),
    FailConvert(String, String),
    FailCbor(String, String),
    IOError(String, String),
    IPCFail(String, String),
    ThreadFail(String, String),
    InvalidFile(String, String),
    /// Invariant violation while replaying a log file, or a malformed row.
    InvalidLog(String, String),
    /// Log file on disk is newer than caller's checkpoint.
    MissingSnapshot(String, String),
    /// Fault injected on the flush path, only used by tests.
    Injected(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            Fatal(p, msg) => write!(f, "{} Fatal: {}", p, msg),
            FailConvert(p, msg) => write!(f, "{} FailConvert: {}", p, msg),
            FailCbor(p, msg) => write!(f, "{} FailCbor: {}", p, msg),
            IOError(p, msg) => write!(f, "{} IOError: {}", p, msg),
            IPCFail(p, msg) => write!(f, "{} IPCFail: {}", p, msg),
            ThreadFail(p, msg) => write!(f, "{} ThreadFail: {}", p, msg),
            InvalidFile(p, msg) => write!(f, "{} InvalidFile: {}", p, msg),
            InvalidLog(p, msg) => write!(f, "{} InvalidLog: {}", p, msg),
            MissingSnapshot(p, msg) => write!(f, "{} MissingSnapshot: {}", p, msg),
            Injected(p, msg) => write!(f, "{} Injected: {}", p, msg),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl error::Error for Error {}
