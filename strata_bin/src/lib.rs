//! Line-oriented shell over the strata engine.

pub mod command;
pub mod errors;
pub mod session;

pub use command::{parse, Command};
pub use errors::ShellError;
pub use session::{Exit, Session, Step};
