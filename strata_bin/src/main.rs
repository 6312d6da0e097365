//! The main entry point for the strata shell.
//!
//! Reads commands from stdin against the database in `STRATA_DATA_DIR`.

use std::io::{self, BufWriter, Write};
use std::process::ExitCode;

use log::error;
use strata::{Database, EngineConfig};
use strata_bin::{Exit, Session, ShellError};

fn run() -> Result<Exit, ShellError> {
    let config = EngineConfig::from_env()?;
    let db = Database::open(config)?;
    let mut session = Session::new(db);

    let stdin = io::stdin();
    let mut stdout = BufWriter::new(io::stdout());
    let exit = session.run(stdin.lock(), &mut stdout)?;
    stdout.flush()?;
    session.finish(exit)?;
    Ok(exit)
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(Exit::Crash) => ExitCode::from(2),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("strata shell failed: {}", e);
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
