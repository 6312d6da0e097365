//! Error types for the storage engine.

use thiserror::Error;

use crate::PageId;
use crate::TxnId;

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum StrataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Buffer manager errors
    #[error("Buffer pool exhausted: all {frames} frames are pinned")]
    BufferExhausted { frames: usize },

    #[error("Invalid page number {page_id} (file has {num_pages} pages)")]
    InvalidPageNumber { page_id: PageId, num_pages: u32 },

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    // Index errors
    #[error("Key not found: {0}")]
    KeyNotFound(i64),

    #[error("Duplicate key: {0}")]
    DuplicateKey(i64),

    // Lock errors
    #[error("Transaction {txn} holds a shared lock and may not upgrade it")]
    LockUpgradeForbidden { txn: TxnId },

    #[error("Transaction {txn} does not hold a lock on {resource}")]
    NotLocked { txn: TxnId, resource: String },

    #[error("Transaction {txn} holds {resource} in a different mode")]
    ModeMismatch { txn: TxnId, resource: String },

    #[error("Transaction {txn} has an uncommitted edit on {resource}")]
    UncommittedWrite { txn: TxnId, resource: String },

    #[error("Deadlock detected: transaction {txn} was rolled back")]
    DeadlockDetected { txn: TxnId },

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(TxnId),

    #[error("No active transaction")]
    NoActiveTransaction,

    // Recovery errors
    #[error("Recovery inconsistency: {0}")]
    RecoveryInconsistency(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Catalog errors
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("Invalid table name: {0:?}")]
    InvalidTableName(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StrataError {
    /// Returns true for the conflicts that replaying an edit twice produces.
    ///
    /// Redo and undo treat these as already applied.
    pub fn is_replay_conflict(&self) -> bool {
        matches!(
            self,
            StrataError::DuplicateKey(_)
                | StrataError::KeyNotFound(_)
                | StrataError::TableAlreadyExists(_)
        )
    }
}
