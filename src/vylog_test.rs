use std::fs;

use super::*;
use crate::record::{Datum, KeyPart};

fn test_dir(name: &str) -> ffi::OsString {
    let mut dir = std::env::temp_dir();
    dir.push(name);
    fs::remove_dir_all(&dir).ok();
    dir.into_os_string()
}

fn parts() -> Vec<KeyPart> {
    vec![KeyPart::new(0, "unsigned", false)]
}

fn vclock(signature: i64) -> Vclock {
    let mut vclock = Vclock::new();
    vclock.follow(1, signature);
    vclock
}

#[test]
fn test_bootstrap() {
    let dir = test_dir("test-vylog-bootstrap");
    let log = Vylog::init(&dir).unwrap();
    log.bootstrap().unwrap();

    // the initial log file exists post bootstrap.
    log.open().unwrap();
    assert!(path::Path::new(&files::to_log_path(&dir, 0)).exists());

    // bootstrapping over leftover log files is refused.
    match log.bootstrap() {
        Err(Error::InvalidFile(_, msg)) => assert!(msg.contains("not empty"), "{}", msg),
        res => panic!("{:?}", res),
    }

    assert_eq!(log.next_id(), 0);
    assert_eq!(log.next_id(), 1);

    log.close().unwrap();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_dump_cycle() {
    let dir = test_dir("test-vylog-dump-cycle");
    let log = Vylog::init(&dir).unwrap();
    log.bootstrap().unwrap();

    let mut txn = log.tx_begin().unwrap();
    txn.write(&Record::create_index(1, 0, 100, parts()));
    txn.write(&Record::insert_range(100, 3, None, None));
    txn.commit().unwrap();

    let mut txn = log.tx_begin().unwrap();
    txn.write(&Record::prepare_run(100, 7));
    txn.commit().unwrap();

    let mut txn = log.tx_begin().unwrap();
    txn.write(&Record::create_run(100, 7, 50));
    txn.write(&Record::insert_slice(
        3,
        7,
        9,
        Some(vec![Datum::Unsigned(5)]),
        Some(vec![Datum::Unsigned(8)]),
    ));
    txn.commit().unwrap();

    let recovery = log.to_recovery(0, false).unwrap();
    let run = recovery.lookup_run(7).unwrap();
    assert!(!run.is_incomplete);
    assert_eq!(run.dump_lsn, Some(50));
    let range = recovery.lookup_range(3).unwrap();
    assert_eq!(range.slices, vec![9]);
    assert_eq!(recovery.lookup_slice(9).unwrap().run_id, 7);

    log.close().unwrap();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_empty_and_abandoned_txn() {
    let dir = test_dir("test-vylog-empty-txn");
    let log = Vylog::init(&dir).unwrap();
    log.bootstrap().unwrap();

    // empty transaction is a successful no-op.
    let txn = log.tx_begin().unwrap();
    txn.commit().unwrap();
    assert!(!path::Path::new(&files::to_log_path(&dir, 0)).exists());

    // dropping an uncommitted transaction rolls it back.
    {
        let mut txn = log.tx_begin().unwrap();
        txn.write(&Record::create_index(1, 0, 100, parts()));
    }
    let txn = log.tx_begin().unwrap();
    txn.commit().unwrap();
    assert!(log.to_recovery(0, false).unwrap().is_empty());

    log.close().unwrap();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_commit_failure_discards() {
    let dir = test_dir("test-vylog-commit-discard");
    let log = Vylog::init(&dir).unwrap();
    log.bootstrap().unwrap();

    log.inject_flush_error(true);
    let mut txn = log.tx_begin().unwrap();
    txn.write(&Record::create_index(1, 0, 100, parts()));
    match txn.commit() {
        Err(Error::Injected(_, _)) => (),
        res => panic!("{:?}", res),
    }
    log.inject_flush_error(false);

    // the failed transaction left nothing behind.
    let txn = log.tx_begin().unwrap();
    txn.commit().unwrap();
    assert!(log.to_recovery(0, false).unwrap().is_empty());

    log.close().unwrap();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_try_commit_retries() {
    let dir = test_dir("test-vylog-try-commit");
    let log = Vylog::init(&dir).unwrap();
    log.bootstrap().unwrap();

    log.inject_flush_error(true);
    let mut txn = log.tx_begin().unwrap();
    txn.write(&Record::create_index(1, 0, 100, parts()));
    txn.try_commit();

    // flush failed, records stayed in the buffer.
    assert!(!path::Path::new(&files::to_log_path(&dir, 0)).exists());

    // the next commit retries the whole buffer.
    log.inject_flush_error(false);
    let mut txn = log.tx_begin().unwrap();
    txn.write(&Record::dump_index(100, 10));
    txn.commit().unwrap();

    let recovery = log.to_recovery(0, false).unwrap();
    let index = recovery.lookup_index(1, 0).unwrap();
    assert_eq!(index.index_lsn, 100);
    assert_eq!(index.dump_lsn, Some(10));

    log.close().unwrap();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_deferred_encode_error() {
    let dir = test_dir("test-vylog-deferred-error");
    let log = Vylog::init(&dir).unwrap();
    log.bootstrap().unwrap();

    let bad = Record::create_index(1, 0, 100, vec![KeyPart::new(0, "float", false)]);

    let mut txn = log.tx_begin().unwrap();
    txn.write(&Record::forget_run(1)); // never reaches disk
    txn.write(&bad);
    txn.write(&Record::forget_run(2)); // ignored after the failure
    match txn.commit() {
        Err(Error::InvalidLog(_, msg)) => assert!(msg.contains("key-part"), "{}", msg),
        res => panic!("{:?}", res),
    }

    // the whole transaction was rolled back.
    let txn = log.tx_begin().unwrap();
    txn.commit().unwrap();
    assert!(log.to_recovery(0, false).unwrap().is_empty());

    log.close().unwrap();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_rotate() {
    let dir = test_dir("test-vylog-rotate");
    let log = Vylog::init(&dir).unwrap();
    log.bootstrap().unwrap();

    let mut txn = log.tx_begin().unwrap();
    txn.write(&Record::create_index(1, 0, 100, parts()));
    txn.write(&Record::create_run(100, 2, 10));
    txn.write(&Record::drop_run(2, 5));
    txn.write(&Record::create_run(100, 3, 20));
    txn.write(&Record::forget_run(2));
    txn.commit().unwrap();

    log.rotate(&vclock(10)).unwrap();
    assert!(path::Path::new(&files::to_log_path(&dir, 10)).exists());

    // the rotated file replays to the same graph, cancelling records
    // compacted away.
    let recovery = log.to_recovery(10, false).unwrap();
    assert!(recovery.lookup_run(2).is_none());
    assert_eq!(recovery.lookup_run(3).unwrap().dump_lsn, Some(20));
    assert_eq!(recovery.lookup_index(1, 0).unwrap().index_lsn, 100);

    // the previous file remains readable.
    let recovery = log.to_recovery(0, false).unwrap();
    assert!(recovery.lookup_run(3).is_some());

    // appends now land in the new file.
    let mut txn = log.tx_begin().unwrap();
    txn.write(&Record::dump_index(100, 30));
    txn.commit().unwrap();
    let recovery = log.to_recovery(10, false).unwrap();
    assert_eq!(recovery.lookup_index(1, 0).unwrap().dump_lsn, Some(30));

    // re-rotating to the same checkpoint is a no-op.
    log.rotate(&vclock(10)).unwrap();
    // rotating backwards is refused.
    assert!(log.rotate(&vclock(5)).is_err());

    log.close().unwrap();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_gc_and_backup() {
    let dir = test_dir("test-vylog-gc-backup");
    let log = Vylog::init(&dir).unwrap();
    log.bootstrap().unwrap();
    log.open().unwrap();

    // backup is not used until there is a previous checkpoint.
    assert_eq!(log.backup_path(&Vclock::new()).unwrap(), None);

    let mut txn = log.tx_begin().unwrap();
    txn.write(&Record::create_index(1, 0, 100, parts()));
    txn.commit().unwrap();

    for signature in [10, 20, 30].iter() {
        log.rotate(&vclock(*signature)).unwrap();
    }
    for signature in [0, 10, 20, 30].iter() {
        assert!(
            path::Path::new(&files::to_log_path(&dir, *signature)).exists(),
            "{}",
            signature
        );
    }

    // the backup for checkpoint 30 is the previous checkpoint's file.
    let path = log.backup_path(&vclock(30)).unwrap().unwrap();
    assert_eq!(path, files::to_log_path(&dir, 20));

    // collecting at 30 keeps the previous file for backup safety.
    log.collect_garbage(30).unwrap();
    assert!(!path::Path::new(&files::to_log_path(&dir, 0)).exists());
    assert!(!path::Path::new(&files::to_log_path(&dir, 10)).exists());
    assert!(path::Path::new(&files::to_log_path(&dir, 20)).exists());
    assert!(path::Path::new(&files::to_log_path(&dir, 30)).exists());

    log.close().unwrap();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_recovery_cycle() {
    let dir = test_dir("test-vylog-recovery-cycle");
    {
        let log = Vylog::init(&dir).unwrap();
        log.bootstrap().unwrap();
        let mut txn = log.tx_begin().unwrap();
        txn.write(&Record::create_index(1, 0, 100, parts()));
        txn.write(&Record::insert_range(100, 3, None, None));
        txn.write(&Record::create_run(100, 7, 50));
        txn.write(&Record::insert_slice(3, 7, 9, None, None));
        txn.commit().unwrap();
        log.close().unwrap();
    }

    // restart.
    let log = Vylog::init(&dir).unwrap();
    let recovery = log.begin_recovery(&Vclock::new()).unwrap();
    assert_eq!(recovery.lookup_index(1, 0).unwrap().index_lsn, 100);
    assert_eq!(recovery.lookup_run(7).unwrap().dump_lsn, Some(50));

    // ids resume above everything observed.
    assert_eq!(log.next_id(), 10);

    // commits during recovery keep records buffered, the log file does
    // not change yet.
    let mut txn = log.tx_begin().unwrap();
    txn.write(&Record::dump_index(100, 60));
    txn.commit().unwrap();
    {
        let side = Recovery::load(&files::to_log_path(&dir, 0), false).unwrap();
        assert_eq!(side.lookup_index(1, 0).unwrap().dump_lsn, None);
    }

    // end of recovery flushes the buffer.
    log.end_recovery(&recovery).unwrap();
    let side = log.to_recovery(0, false).unwrap();
    assert_eq!(side.lookup_index(1, 0).unwrap().dump_lsn, Some(60));

    log.close().unwrap();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_recovery_from_backup() {
    let dir = test_dir("test-vylog-recovery-backup");
    {
        let log = Vylog::init(&dir).unwrap();
        log.bootstrap().unwrap();
        let mut txn = log.tx_begin().unwrap();
        txn.write(&Record::create_index(1, 0, 100, parts()));
        txn.commit().unwrap();
        log.rotate(&vclock(10)).unwrap();
        log.close().unwrap();
    }

    // restored from a backup whose checkpoint is 20, while the latest
    // log file on disk is 10. End of recovery materializes 20.vylog to
    // bring log and checkpoint signatures back in sync.
    let log = Vylog::init(&dir).unwrap();
    let recovery = log.begin_recovery(&vclock(20)).unwrap();
    assert!(recovery.lookup_index(1, 0).is_some());

    let mut txn = log.tx_begin().unwrap();
    txn.write(&Record::dump_index(100, 70));
    txn.commit().unwrap();

    log.end_recovery(&recovery).unwrap();
    assert!(path::Path::new(&files::to_log_path(&dir, 20)).exists());

    // the new file carries the graph and the records deferred during
    // recovery, after its snapshot prefix.
    let side = log.to_recovery(20, false).unwrap();
    assert_eq!(side.lookup_index(1, 0).unwrap().dump_lsn, Some(70));
    let side = log.to_recovery(20, true).unwrap();
    assert_eq!(side.lookup_index(1, 0).unwrap().dump_lsn, None);

    log.close().unwrap();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_missing_snapshot() {
    let dir = test_dir("test-vylog-missing-snapshot");
    {
        let log = Vylog::init(&dir).unwrap();
        log.bootstrap().unwrap();
        let mut txn = log.tx_begin().unwrap();
        txn.write(&Record::create_index(1, 0, 100, parts()));
        txn.commit().unwrap();
        log.rotate(&vclock(30)).unwrap();
        log.close().unwrap();
    }

    // the log on disk is newer than the caller's checkpoint, somebody
    // removed a snapshot but left the log behind.
    let log = Vylog::init(&dir).unwrap();
    match log.begin_recovery(&vclock(20)) {
        Err(Error::MissingSnapshot(_, _)) => (),
        res => panic!("{:?}", res),
    }

    log.close().unwrap();
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_begin_recovery_fresh() {
    let dir = test_dir("test-vylog-recovery-fresh");
    // no directory on disk at all.
    let log = Vylog::init(&dir).unwrap();
    let recovery = log.begin_recovery(&Vclock::new()).unwrap();
    assert!(recovery.is_empty());
    log.end_recovery(&recovery).unwrap();
    assert!(path::Path::new(&files::to_log_path(&dir, 0)).exists());

    log.close().unwrap();
    fs::remove_dir_all(&dir).ok();
}
