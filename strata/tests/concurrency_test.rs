mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{commit_inserts, config, init_logging, TABLE};
use rand::Rng;
use strata::{Database, StrataError, TreeOptions};
use tempfile::tempdir;

const TOTAL_KEYS: i64 = 10_000;
const BATCH: usize = 100;

fn open_for_load(dir: &std::path::Path) -> Arc<Database> {
    init_logging();
    let db = Database::open_with_options(config(dir, 256), TreeOptions::with_capacities(16, 16))
        .unwrap();
    db.create_table("btree", TABLE).unwrap();
    Arc::new(db)
}

/// Worker `w` of `n` owns every key congruent to `w` modulo `n`, so the
/// streams interleave across the whole key space without sharing a key.
fn load_interleaved(workers: i64) {
    let dir = tempdir().unwrap();
    let db = open_for_load(dir.path());

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let keys: Vec<i64> = (1..=TOTAL_KEYS).filter(|k| k % workers == worker).collect();
                for chunk in keys.chunks(BATCH) {
                    let txn = db.begin().unwrap();
                    for &key in chunk {
                        db.insert(txn, TABLE, key, key * 7).unwrap();
                    }
                    db.commit(txn).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(db.check_table(TABLE).unwrap(), TOTAL_KEYS as usize);
    let entries = db.scan(TABLE).unwrap();
    let expected: Vec<(i64, i64)> = (1..=TOTAL_KEYS).map(|k| (k, k * 7)).collect();
    assert_eq!(entries, expected);
    assert!(db.transactions().active_transactions().is_empty());
    assert!(db.transactions().waits_for_snapshot().is_empty());
}

#[test]
fn test_load_single_worker() {
    load_interleaved(1);
}

#[test]
fn test_load_eight_workers() {
    load_interleaved(8);
}

#[test]
fn test_load_sixteen_workers() {
    load_interleaved(16);
}

#[test]
fn test_load_survives_crash() {
    let dir = tempdir().unwrap();
    let db = open_for_load(dir.path());
    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let txn = db.begin().unwrap();
                for key in (0..2_000).filter(|k| k % 4 == worker) {
                    db.insert(txn, TABLE, key, -key).unwrap();
                }
                db.commit(txn).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let db = Arc::try_unwrap(db).ok().unwrap();
    db.crash();

    let db = Database::open_with_options(config(dir.path(), 256), TreeOptions::with_capacities(16, 16))
        .unwrap();
    assert_eq!(db.check_table(TABLE).unwrap(), 2_000);
    assert_eq!(db.find(TABLE, 1_999).unwrap(), Some(-1_999));
}

#[test]
fn test_readers_see_whole_entries_during_splits() {
    let dir = tempdir().unwrap();
    let db = open_for_load(dir.path());
    let stable: Vec<(i64, i64)> = (100_000..101_000).map(|k| (k, k * 3)).collect();
    commit_inserts(&db, &stable);

    let done = Arc::new(AtomicBool::new(false));
    let writer = {
        let db = Arc::clone(&db);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for chunk in (0..3_000i64).collect::<Vec<_>>().chunks(BATCH) {
                let txn = db.begin().unwrap();
                for &key in chunk {
                    db.insert(txn, TABLE, key, key * 3).unwrap();
                }
                db.commit(txn).unwrap();
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            let done = Arc::clone(&done);
            let stable = stable.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut rounds = 0;
                while !done.load(Ordering::SeqCst) || rounds < 3 {
                    assert_eq!(db.scan_range(TABLE, 100_000, 100_999).unwrap(), stable);
                    for _ in 0..50 {
                        let key = rng.gen_range(0..3_000);
                        if let Some(value) = db.find(TABLE, key).unwrap() {
                            assert_eq!(value, key * 3);
                        }
                    }
                    let prefix = db.scan_range(TABLE, 0, 2_999).unwrap();
                    assert!(prefix.windows(2).all(|w| w[0].0 < w[1].0));
                    assert!(prefix.iter().all(|(k, v)| *v == k * 3));
                    rounds += 1;
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(db.check_table(TABLE).unwrap(), 4_000);
}

#[test]
fn test_deadlock_picks_exactly_one_victim() {
    let dir = tempdir().unwrap();
    let db = open_for_load(dir.path());
    commit_inserts(&db, &[(1, 10), (2, 20)]);

    let barrier = Arc::new(Barrier::new(2));
    let run = |first: i64, second: i64| {
        let db = Arc::clone(&db);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let txn = db.begin().unwrap();
            db.update(txn, TABLE, first, first * 100).unwrap();
            barrier.wait();
            match db.update(txn, TABLE, second, second * 100) {
                Ok(_) => {
                    db.commit(txn).unwrap();
                    Ok(txn)
                }
                Err(e) => Err((txn, e)),
            }
        })
    };
    let a = run(1, 2);
    let b = run(2, 1);
    let results = [a.join().unwrap(), b.join().unwrap()];

    let victims: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(victims.len(), 1);
    let (victim, error) = victims[0];
    assert!(matches!(error, StrataError::DeadlockDetected { txn } if txn == victim));
    assert!(!db.is_active(*victim));
    assert!(db.transactions().held_locks(*victim).is_empty());

    // The survivor's two updates are both visible; the victim's were undone.
    assert_eq!(db.scan(TABLE).unwrap(), vec![(1, 100), (2, 200)]);
    assert!(db.transactions().waits_for_snapshot().is_empty());
}

#[test]
fn test_waiter_proceeds_after_commit() {
    let dir = tempdir().unwrap();
    let db = open_for_load(dir.path());

    let holder = db.begin().unwrap();
    db.insert(holder, TABLE, 5, 50).unwrap();

    let waiter = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            let txn = db.begin().unwrap();
            let old = db.update(txn, TABLE, 5, 51).unwrap();
            db.commit(txn).unwrap();
            old
        })
    };

    // Wait until the second transaction is queued behind the first.
    while db.transactions().waits_for_snapshot().is_empty() {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(db.transactions().waits_for_snapshot(), vec![(holder + 1, holder)]);
    db.commit(holder).unwrap();

    assert_eq!(waiter.join().unwrap(), 50);
    assert_eq!(db.find(TABLE, 5).unwrap(), Some(51));
}

#[test]
fn test_rollback_keeps_waiter_write() {
    let dir = tempdir().unwrap();
    let db = open_for_load(dir.path());
    commit_inserts(&db, &[(1, 100)]);

    let first = db.begin().unwrap();
    db.update(first, TABLE, 1, 150).unwrap();

    let waiter = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            let txn = db.begin().unwrap();
            let old = db.update(txn, TABLE, 1, 777).unwrap();
            db.commit(txn).unwrap();
            old
        })
    };
    while db.transactions().waits_for_snapshot().is_empty() {
        thread::sleep(Duration::from_millis(1));
    }

    // The waiter only gets the lock once the undo is done.
    db.abort(first).unwrap();
    assert_eq!(waiter.join().unwrap(), 100);
    assert_eq!(db.find(TABLE, 1).unwrap(), Some(777));
}
