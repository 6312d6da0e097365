mod common;

use std::fs::OpenOptions;
use std::io::Write;

use common::{commit_inserts, open, open_with_table, TABLE};
use strata::failpoint;
use strata::wal::{read_log, Action, Edit, LogRecord, LogWriter};
use strata::StrataError;
use tempfile::tempdir;

#[test]
fn test_abort_undoes_insert() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path());

    let txn = db.begin().unwrap();
    db.insert(txn, TABLE, 7, 700).unwrap();
    assert_eq!(db.find(TABLE, 7).unwrap(), Some(700));
    db.abort(txn).unwrap();

    assert_eq!(db.find(TABLE, 7).unwrap(), None);
    assert!(!db.is_active(txn));
    assert!(db.transactions().held_locks(txn).is_empty());

    db.crash();
    let db = open(dir.path());
    assert_eq!(db.find(TABLE, 7).unwrap(), None);
}

#[test]
fn test_abort_restores_updates_and_deletes() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path());
    commit_inserts(&db, &[(1, 10), (2, 20), (3, 30)]);

    let txn = db.begin().unwrap();
    db.update(txn, TABLE, 1, 11).unwrap();
    db.update(txn, TABLE, 1, 12).unwrap();
    db.delete(txn, TABLE, 2).unwrap();
    db.insert(txn, TABLE, 4, 40).unwrap();
    db.abort(txn).unwrap();

    assert_eq!(db.scan(TABLE).unwrap(), vec![(1, 10), (2, 20), (3, 30)]);
}

#[test]
fn test_committed_data_survives_crash() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path());
    let entries: Vec<(i64, i64)> = (0..300).map(|k| (k, k * 2)).collect();
    commit_inserts(&db, &entries);
    db.crash();

    let db = open(dir.path());
    assert_eq!(db.check_table(TABLE).unwrap(), 300);
    assert_eq!(db.scan(TABLE).unwrap(), entries);
}

#[test]
fn test_checkpoint_crash_scenario() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path());
    commit_inserts(&db, &[(1, 100), (2, 200)]);
    db.checkpoint().unwrap();

    let txn = db.begin().unwrap();
    db.insert(txn, TABLE, 3, 300).unwrap();
    db.update(txn, TABLE, 1, 150).unwrap();
    db.crash();

    let db = open(dir.path());
    assert_eq!(db.find(TABLE, 1).unwrap(), Some(100));
    assert_eq!(db.find(TABLE, 2).unwrap(), Some(200));
    assert_eq!(db.find(TABLE, 3).unwrap(), None);
}

#[test]
fn test_undo_reaches_edits_before_checkpoint() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path());
    commit_inserts(&db, &[(1, 100)]);

    let txn = db.begin().unwrap();
    db.insert(txn, TABLE, 5, 500).unwrap();
    db.checkpoint().unwrap();
    db.update(txn, TABLE, 1, 101).unwrap();
    db.crash();

    let db = open(dir.path());
    assert_eq!(db.scan(TABLE).unwrap(), vec![(1, 100)]);
}

#[test]
fn test_transaction_spanning_checkpoint_commits() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path());

    let txn = db.begin().unwrap();
    db.insert(txn, TABLE, 1, 1).unwrap();
    let first = db.checkpoint().unwrap();
    db.insert(txn, TABLE, 2, 2).unwrap();
    db.commit(txn).unwrap();
    let second = db.checkpoint().unwrap();
    assert!(second > first);
    commit_inserts(&db, &[(3, 3)]);
    db.crash();

    let db = open(dir.path());
    assert_eq!(db.scan(TABLE).unwrap(), vec![(1, 1), (2, 2), (3, 3)]);
    // Only the newest snapshot is kept.
    let snapshots: Vec<_> = std::fs::read_dir(db.config().checkpoint_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(snapshots, vec![second.to_string()]);
}

#[test]
fn test_recovery_is_idempotent() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path());
    commit_inserts(&db, &[(1, 100), (2, 200)]);
    db.checkpoint().unwrap();
    let txn = db.begin().unwrap();
    db.insert(txn, TABLE, 3, 300).unwrap();
    db.update(txn, TABLE, 2, 250).unwrap();
    db.crash();

    let db = open(dir.path());
    let once = db.scan(TABLE).unwrap();

    let summary = db.recover().unwrap();
    assert!(summary.rolled_back.is_empty());
    assert_eq!(db.scan(TABLE).unwrap(), once);

    db.crash();
    let db = open(dir.path());
    assert_eq!(db.scan(TABLE).unwrap(), once);
    assert_eq!(once, vec![(1, 100), (2, 200)]);
}

#[test]
fn test_crash_during_rollback_resumes_undo() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path());
    commit_inserts(&db, &[(1, 100)]);

    let txn = db.begin().unwrap();
    db.update(txn, TABLE, 1, 150).unwrap();
    db.insert(txn, TABLE, 2, 200).unwrap();
    db.insert(txn, TABLE, 3, 300).unwrap();

    failpoint::enable(failpoint::DURING_ROLLBACK);
    let err = db.abort(txn).unwrap_err();
    failpoint::disable(failpoint::DURING_ROLLBACK);
    assert!(matches!(err, StrataError::Io(_)));
    // The newest edit is already undone.
    assert_eq!(db.find(TABLE, 3).unwrap(), None);
    assert_eq!(db.find(TABLE, 2).unwrap(), Some(200));
    db.crash();

    let db = open(dir.path());
    assert_eq!(db.scan(TABLE).unwrap(), vec![(1, 100)]);

    let log = read_log(db.config().log_path()).unwrap();
    let compensations = log
        .entries
        .iter()
        .filter(|e| matches!(e.record, LogRecord::Compensate(_)))
        .count();
    // One before the crash and two during recovery: nothing is undone twice.
    assert_eq!(compensations, 3);
}

#[test]
fn test_crash_between_log_and_mutation() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path());
    commit_inserts(&db, &[(1, 100)]);

    let txn = db.begin().unwrap();
    failpoint::enable(failpoint::AFTER_EDIT_LOGGED);
    let result = db.update(txn, TABLE, 1, 999);
    failpoint::disable(failpoint::AFTER_EDIT_LOGGED);
    assert!(result.is_err());
    assert_eq!(db.find(TABLE, 1).unwrap(), Some(100));
    db.crash();

    let db = open(dir.path());
    assert_eq!(db.find(TABLE, 1).unwrap(), Some(100));
}

#[test]
fn test_incomplete_snapshot_is_ignored() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path());
    commit_inserts(&db, &[(1, 1)]);
    db.checkpoint().unwrap();
    commit_inserts(&db, &[(2, 2)]);

    failpoint::enable(failpoint::BEFORE_SNAPSHOT);
    assert!(db.checkpoint().is_err());
    failpoint::disable(failpoint::BEFORE_SNAPSHOT);
    db.crash();

    let db = open(dir.path());
    assert_eq!(db.scan(TABLE).unwrap(), vec![(1, 1), (2, 2)]);
    commit_inserts(&db, &[(3, 3)]);
    db.checkpoint().unwrap();
    db.crash();

    let db = open(dir.path());
    assert_eq!(db.scan(TABLE).unwrap(), vec![(1, 1), (2, 2), (3, 3)]);
}

#[test]
fn test_torn_log_tail_is_truncated() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path());
    commit_inserts(&db, &[(1, 1), (2, 2)]);
    let log_path = db.config().log_path();
    db.crash();

    let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
    file.write_all(b"1234abcd {\"kind\":\"begin\",\"tx").unwrap();
    drop(file);

    let db = open(dir.path());
    assert_eq!(db.scan(TABLE).unwrap(), vec![(1, 1), (2, 2)]);
    let contents = read_log(&log_path).unwrap();
    assert!(!contents.torn_tail);

    commit_inserts(&db, &[(3, 3)]);
    db.crash();
    let db = open(dir.path());
    assert_eq!(db.find(TABLE, 3).unwrap(), Some(3));
}

#[test]
fn test_edit_of_unknown_table_fails_recovery() {
    let dir = tempdir().unwrap();
    let config = common::config(dir.path(), 64);
    std::fs::create_dir_all(dir.path()).unwrap();
    let mut writer = LogWriter::open(config.log_path()).unwrap();
    writer.append(&LogRecord::Begin { txn: 1 }).unwrap();
    writer
        .append(&LogRecord::Edit(Edit {
            txn: 1,
            table: "ghost".to_string(),
            action: Action::Insert,
            key: 1,
            old: None,
            new: Some(1),
        }))
        .unwrap();
    drop(writer);

    let result = strata::Database::open(config);
    assert!(matches!(result, Err(StrataError::RecoveryInconsistency(_))));
}

#[test]
fn test_inconsistent_log_leaves_table_files_alone() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path());
    commit_inserts(&db, &[(1, 10), (2, 20)]);
    let config = db.config().clone();
    db.close().unwrap();

    let table_file = dir.path().join(format!("{TABLE}.tbl"));
    let before = std::fs::read(&table_file).unwrap();
    let mut writer = LogWriter::open(config.log_path()).unwrap();
    writer.append(&LogRecord::Commit { txn: 999 }).unwrap();
    drop(writer);

    let result = strata::Database::open(config);
    assert!(matches!(result, Err(StrataError::RecoveryInconsistency(_))));
    assert_eq!(std::fs::read(&table_file).unwrap(), before);
}

#[test]
fn test_transaction_ids_continue_after_restart() {
    let dir = tempdir().unwrap();
    let db = open_with_table(dir.path());
    let first = db.begin().unwrap();
    db.commit(first).unwrap();
    let second = db.begin().unwrap();
    db.crash();

    let db = open(dir.path());
    let third = db.begin().unwrap();
    assert!(third > second && second > first);
}
