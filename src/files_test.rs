use std::{convert::TryFrom, fs};

use super::*;

#[test]
fn test_log_file_name() {
    let fname = LogFileName::from(0);
    assert_eq!(fname.to_string(), "0.vylog");
    assert_eq!(i64::try_from(fname).unwrap(), 0);

    let fname = LogFileName::from(12345);
    assert_eq!(fname.to_string(), "12345.vylog");
    assert_eq!(i64::try_from(fname.clone()).unwrap(), 12345);
    assert_eq!(ffi::OsString::from(fname), ffi::OsString::from("12345.vylog"));

    for junk in ["x.vylog", "12345.dat", "12345", "-1.vylog"].iter() {
        let fname = LogFileName(ffi::OsString::from(*junk));
        assert!(i64::try_from(fname).is_err(), "{}", junk);
    }
}

#[test]
fn test_log_paths() {
    let dir = ffi::OsString::from("/tmp/vylog-files-test");
    let loc = to_log_path(&dir, 42);
    assert!(loc.to_str().unwrap().ends_with("42.vylog"));
    let tmp = to_tmp_path(&loc);
    assert!(tmp.to_str().unwrap().ends_with("42.vylog.inprogress"));
}

#[test]
fn test_scan_dir() {
    let dir = {
        let mut dir = std::env::temp_dir();
        dir.push("test-vylog-scan-dir");
        dir.into_os_string()
    };
    fs::remove_dir_all(&dir).ok();
    fs::create_dir_all(&dir).unwrap();

    for name in ["10.vylog", "0.vylog", "30.vylog", "junk.txt", "5.vylog.inprogress"].iter() {
        let mut loc = path::PathBuf::from(&dir);
        loc.push(name);
        fs::write(&loc, b"").unwrap();
    }

    assert_eq!(scan_dir(&dir).unwrap(), vec![0, 10, 30]);

    fs::remove_dir_all(&dir).ok();
}
