pub mod btree;

pub mod buffer_pool;

pub mod catalog;

pub mod config;

pub mod database;

pub mod error;

pub mod failpoint;

pub mod index;

pub mod lock_manager;

pub mod page;

pub mod pager;

pub mod recovery;

pub mod transaction;

pub mod wal;

pub const PAGE_SIZE: usize = 4096;

pub type PageId = u32;

pub type TxnId = u64;

pub type Key = i64;

pub type Value = i64;

pub use btree::{BPlusTree, Cursor, TreeOptions};
pub use buffer_pool::{BufferPool, PageGuard};
pub use config::EngineConfig;
pub use database::Database;
pub use error::{Result, StrataError};
pub use index::Index;
pub use lock_manager::{LockMode, Resource};
pub use page::Page;
pub use transaction::TransactionManager;
pub use wal::{Action, LogRecord};
