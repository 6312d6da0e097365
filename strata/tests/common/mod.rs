#![allow(dead_code)]

use std::path::Path;

use strata::{Database, EngineConfig, TreeOptions};

pub const TABLE: &str = "accounts";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn config(dir: &Path, pool_pages: usize) -> EngineConfig {
    EngineConfig {
        buffer_pool_pages: pool_pages,
        ..EngineConfig::with_data_dir(dir)
    }
}

/// Small nodes so that a few hundred keys already build a multi-level tree.
pub fn small_nodes() -> TreeOptions {
    TreeOptions::with_capacities(8, 8)
}

pub fn open(dir: &Path) -> Database {
    init_logging();
    Database::open_with_options(config(dir, 64), small_nodes()).unwrap()
}

pub fn open_with_table(dir: &Path) -> Database {
    let db = open(dir);
    db.create_table("btree", TABLE).unwrap();
    db
}

/// Commits `entries` in a single transaction.
pub fn commit_inserts(db: &Database, entries: &[(i64, i64)]) {
    let txn = db.begin().unwrap();
    for (key, value) in entries {
        db.insert(txn, TABLE, *key, *value).unwrap();
    }
    db.commit(txn).unwrap();
}
