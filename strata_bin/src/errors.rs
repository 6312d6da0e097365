use strata::{StrataError, TxnId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Transaction {0} is already open")]
    TransactionOpen(TxnId),

    #[error(transparent)]
    Engine(#[from] StrataError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
