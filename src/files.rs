use std::{convert::TryFrom, ffi, fmt, fs, path, result};

use crate::{Error, Result};

/// A log file is uniquely locatable by providing the `dir` and the
/// checkpoint signature it belongs to. `format!("{}.vylog", signature)`
#[derive(Clone)]
pub struct LogFileName(pub ffi::OsString);

impl From<i64> for LogFileName {
    fn from(signature: i64) -> LogFileName {
        let file_name = format!("{}.vylog", signature);
        LogFileName(AsRef::<ffi::OsStr>::as_ref(&file_name).to_os_string())
    }
}

impl TryFrom<LogFileName> for i64 {
    type Error = Error;

    fn try_from(fname: LogFileName) -> Result<i64> {
        let ffpp = path::Path::new(&fname.0);
        let signature = || -> Option<i64> {
            let fname = ffpp.file_name()?;
            if fname.to_str()?.ends_with(".vylog") {
                path::Path::new(fname).file_stem()?.to_str()?.parse().ok()
            } else {
                None
            }
        }();

        match signature {
            Some(signature) if signature >= 0 => Ok(signature),
            Some(_) | None => err_at!(InvalidFile, msg: "{:?}", ffpp),
        }
    }
}

impl From<LogFileName> for ffi::OsString {
    fn from(fname: LogFileName) -> ffi::OsString {
        fname.0
    }
}

impl fmt::Display for LogFileName {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        match self.0.to_str() {
            Some(s) => write!(f, "{}", s),
            None => write!(f, "{:?}", self.0),
        }
    }
}

/// Compose a path to the log file for `signature` under `dir`.
pub fn to_log_path(dir: &ffi::OsStr, signature: i64) -> ffi::OsString {
    let loc: path::PathBuf =
        [dir.to_os_string(), LogFileName::from(signature).into()].iter().collect();
    loc.into_os_string()
}

/// Compose the in-progress path for `loc`, the name a log file carries
/// while it is being written, before the final rename.
pub fn to_tmp_path(loc: &ffi::OsStr) -> ffi::OsString {
    let mut tmp = loc.to_os_string();
    tmp.push(".inprogress");
    tmp
}

/// Scan `dir` for log files, return their signatures in ascending order.
/// Files that do not match the log file-name structure are ignored.
pub fn scan_dir(dir: &ffi::OsStr) -> Result<Vec<i64>> {
    let mut signatures = vec![];
    for item in err_at!(IOError, fs::read_dir(dir), "reading {:?}", dir)? {
        let fname = LogFileName(err_at!(IOError, item)?.file_name());
        if let Ok(signature) = i64::try_from(fname) {
            signatures.push(signature)
        }
    }
    signatures.sort_unstable();
    Ok(signatures)
}

#[cfg(test)]
#[path = "files_test.rs"]
mod files_test;
