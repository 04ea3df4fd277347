use cbordata::Cbor;

use std::fs;

use super::*;
use crate::record::{Kind, KeyPart};

fn test_dir(name: &str) -> ffi::OsString {
    let mut dir = std::env::temp_dir();
    dir.push(name);
    fs::remove_dir_all(&dir).ok();
    fs::create_dir_all(&dir).unwrap();
    dir.into_os_string()
}

fn read_records(path: &ffi::OsStr) -> Vec<Record> {
    let data = fs::read(path).unwrap();
    let mut buf = data.as_slice();
    let mut records = vec![];
    while !buf.is_empty() {
        let (value, _) = Cbor::decode(&mut buf).unwrap();
        records.push(Record::from_row(value).unwrap());
    }
    records
}

#[test]
fn test_journal_open_policy() {
    let dir = test_dir("test-vylog-journal-open");
    let journal = Journal::init("open-policy").unwrap();
    let loc = files::to_log_path(&dir, 0);

    // a missing file is created with a leading snapshot marker.
    journal.open(&loc).unwrap();
    assert!(path::Path::new(&loc).exists());
    let records = read_records(&loc);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].to_kind(), Kind::Snapshot);

    // appends land after the marker, in order.
    let rows = vec![
        Record::prepare_run(100, 7).encode().unwrap(),
        Record::create_run(100, 7, 50).encode().unwrap(),
    ];
    journal.append(&loc, rows).unwrap();

    let records = read_records(&loc);
    let kinds: Vec<Kind> = records.iter().map(|r| r.to_kind()).collect();
    assert_eq!(kinds, vec![Kind::Snapshot, Kind::PrepareRun, Kind::CreateRun]);

    journal.close().unwrap();

    // an existing file is opened for appending, not truncated.
    let journal = Journal::init("open-policy").unwrap();
    journal.append(&loc, vec![Record::drop_run(7, 10).encode().unwrap()]).unwrap();
    let records = read_records(&loc);
    assert_eq!(records.len(), 4);
    assert_eq!(records[3].to_kind(), Kind::DropRun);
    journal.close().unwrap();

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_journal_rotate() {
    let dir = test_dir("test-vylog-journal-rotate");
    let journal = Journal::init("rotate").unwrap();

    let loc0 = files::to_log_path(&dir, 0);
    journal.append(&loc0, vec![Record::forget_run(1).encode().unwrap()]).unwrap();
    journal.rotate().unwrap();

    let loc10 = files::to_log_path(&dir, 10);
    journal.append(&loc10, vec![Record::forget_run(2).encode().unwrap()]).unwrap();

    assert_eq!(read_records(&loc0).len(), 2);
    let records = read_records(&loc10);
    assert_eq!(records[0].to_kind(), Kind::Snapshot);
    assert_eq!(records[1], Record::forget_run(2));

    journal.close().unwrap();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_journal_inject() {
    let dir = test_dir("test-vylog-journal-inject");
    let journal = Journal::init("inject").unwrap();
    let loc = files::to_log_path(&dir, 0);

    journal.inject_flush_error(true);
    match journal.append(&loc, vec![Record::forget_run(1).encode().unwrap()]) {
        Err(Error::Injected(_, _)) => (),
        res => panic!("{:?}", res),
    }
    // nothing was written, not even the snapshot marker.
    assert!(!path::Path::new(&loc).exists());

    journal.inject_flush_error(false);
    journal.append(&loc, vec![Record::forget_run(1).encode().unwrap()]).unwrap();
    assert_eq!(read_records(&loc).len(), 2);

    journal.close().unwrap();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_save_and_load_log() {
    let dir = test_dir("test-vylog-journal-save");
    let parts = vec![KeyPart::new(0, "unsigned", false)];

    let mut recovery = Recovery::new();
    recovery.apply(&Record::create_index(1, 0, 100, parts)).unwrap();
    recovery.apply(&Record::prepare_run(100, 7)).unwrap();

    let loc = files::to_log_path(&dir, 20);
    save_log(&loc, &recovery).unwrap();

    // the snapshot prefix is terminated by the snapshot marker, and the
    // in-progress file is gone.
    let records = read_records(&loc);
    let kinds: Vec<Kind> = records.iter().map(|r| r.to_kind()).collect();
    assert_eq!(kinds, vec![Kind::CreateIndex, Kind::PrepareRun, Kind::Snapshot]);
    assert!(!path::Path::new(&files::to_tmp_path(&loc)).exists());

    // replaying the file reconstructs the graph.
    let loaded = Recovery::load(&loc, false).unwrap();
    assert_eq!(loaded, recovery);

    // an empty graph still materializes a file, with the marker alone.
    let empty = files::to_log_path(&dir, 30);
    save_log(&empty, &Recovery::new()).unwrap();
    let records = read_records(&empty);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].to_kind(), Kind::Snapshot);
    assert!(Recovery::load(&empty, false).unwrap().is_empty());

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_load_only_checkpoint() {
    let dir = test_dir("test-vylog-journal-only-checkpoint");
    let parts = vec![KeyPart::new(0, "unsigned", false)];

    let mut recovery = Recovery::new();
    recovery.apply(&Record::create_index(1, 0, 100, parts)).unwrap();

    let loc = files::to_log_path(&dir, 20);
    save_log(&loc, &recovery).unwrap();

    // records appended after the checkpoint...
    let journal = Journal::init("only-checkpoint").unwrap();
    let rows = vec![Record::prepare_run(100, 7).encode().unwrap()];
    journal.append(&loc, rows).unwrap();
    journal.close().unwrap();

    // ...are ignored by a checkpoint reader,
    let loaded = Recovery::load(&loc, true).unwrap();
    assert!(loaded.lookup_run(7).is_none());
    assert!(loaded.lookup_index(1, 0).is_some());

    // and replayed by a full reader.
    let loaded = Recovery::load(&loc, false).unwrap();
    assert!(loaded.lookup_run(7).is_some());

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_load_missing_and_corrupt() {
    let dir = test_dir("test-vylog-journal-load-corrupt");

    let missing = files::to_log_path(&dir, 40);
    assert!(Recovery::load(&missing, false).unwrap().is_empty());

    // a corrupt file aborts replay with InvalidLog.
    let corrupt = files::to_log_path(&dir, 50);
    fs::write(&corrupt, b"\xde\xad\xbe\xef").unwrap();
    match Recovery::load(&corrupt, false) {
        Err(Error::InvalidLog(_, _)) => (),
        res => panic!("{:?}", res),
    }

    fs::remove_dir_all(&dir).ok();
}
