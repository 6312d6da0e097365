//! One interactive session: a database plus the transaction it has open.

use std::io::{BufRead, Write};

use log::{info, warn};
use strata::{Database, StrataError, TxnId};

use crate::command::{self, Command};
use crate::errors::ShellError;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Quit,
    Crash,
    EndOfInput,
}

pub enum Step {
    Reply(String),
    Exit(Exit),
}

pub struct Session {
    db: Database,
    txn: Option<TxnId>,
}

impl Session {
    pub fn new(db: Database) -> Self {
        Self { db, txn: None }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn current_transaction(&self) -> Option<TxnId> {
        self.txn
    }

    fn require_txn(&self) -> Result<TxnId, ShellError> {
        self.txn.ok_or(ShellError::Engine(StrataError::NoActiveTransaction))
    }

    pub fn execute(&mut self, command: Command) -> Result<Step, ShellError> {
        let result = self.dispatch(command);
        // A deadlock victim or a failed rollback may have ended the transaction.
        if let Some(txn) = self.txn {
            if !self.db.is_active(txn) {
                self.txn = None;
            }
        }
        result
    }

    fn dispatch(&mut self, command: Command) -> Result<Step, ShellError> {
        let reply = match command {
            Command::CreateTable { kind, name } => {
                self.db.create_table(&kind, &name)?;
                format!("created {kind} table {name}")
            }
            Command::Begin => {
                if let Some(txn) = self.txn {
                    return Err(ShellError::TransactionOpen(txn));
                }
                let txn = self.db.begin()?;
                self.txn = Some(txn);
                format!("transaction {txn} started")
            }
            Command::Commit => {
                let txn = self.require_txn()?;
                self.db.commit(txn)?;
                self.txn = None;
                format!("transaction {txn} committed")
            }
            Command::Abort => {
                let txn = self.require_txn()?;
                self.db.abort(txn)?;
                self.txn = None;
                format!("transaction {txn} rolled back")
            }
            Command::Insert { table, key, value } => {
                let txn = self.require_txn()?;
                self.db.insert(txn, &table, key, value)?;
                format!("inserted {key}")
            }
            Command::Update { table, key, value } => {
                let txn = self.require_txn()?;
                let old = self.db.update(txn, &table, key, value)?;
                format!("updated {key} (was {old})")
            }
            Command::Delete { table, key } => {
                let txn = self.require_txn()?;
                if self.db.delete(txn, &table, key)? {
                    format!("deleted {key}")
                } else {
                    format!("{key} not present")
                }
            }
            Command::Lock { table, key } => {
                let txn = self.require_txn()?;
                self.db.lock(txn, &table, key)?;
                format!("locked {table}/{key}")
            }
            Command::Find { table, key } => match self.db.find(&table, key)? {
                Some(value) => format!("{key}: {value}"),
                None => format!("{key} not found"),
            },
            Command::Select { table, range } => {
                let entries = match range {
                    Some((lo, hi)) => self.db.scan_range(&table, lo, hi)?,
                    None => self.db.scan(&table)?,
                };
                let mut out: Vec<String> = entries.iter().map(|(k, v)| format!("{k}: {v}")).collect();
                out.push(format!("({} rows)", entries.len()));
                out.join("\n")
            }
            Command::Pretty { table } => self.db.pretty(&table)?.trim_end().to_string(),
            Command::Checkpoint => format!("checkpoint {} written", self.db.checkpoint()?),
            Command::Tables => self.db.table_names().join("\n"),
            Command::Crash => return Ok(Step::Exit(Exit::Crash)),
            Command::Quit => return Ok(Step::Exit(Exit::Quit)),
        };
        Ok(Step::Reply(reply))
    }

    /// Executes every line of `input`, writing replies and errors to `output`.
    /// Errors are reported and the session continues.
    pub fn run<R: BufRead, W: Write>(&mut self, input: R, output: &mut W) -> Result<Exit, ShellError> {
        for line in input.lines() {
            let line = line?;
            let step = command::parse(&line).and_then(|parsed| match parsed {
                Some(command) => self.execute(command).map(Some),
                None => Ok(None),
            });
            match step {
                Ok(Some(Step::Reply(reply))) => {
                    if !reply.is_empty() {
                        writeln!(output, "{reply}")?;
                    }
                }
                Ok(Some(Step::Exit(exit))) => return Ok(exit),
                Ok(None) => {}
                Err(e) => {
                    warn!("command {:?} failed: {}", line.trim(), e);
                    writeln!(output, "error: {e}")?;
                }
            }
        }
        Ok(Exit::EndOfInput)
    }

    /// Ends the session. An open transaction is left to recovery on a crash
    /// and rolled back otherwise.
    pub fn finish(self, exit: Exit) -> Result<(), ShellError> {
        match exit {
            Exit::Crash => {
                self.db.crash();
                Ok(())
            }
            Exit::Quit | Exit::EndOfInput => {
                if let Some(txn) = self.txn {
                    info!("rolling back open transaction {} on exit", txn);
                    self.db.abort(txn)?;
                }
                self.db.close()?;
                Ok(())
            }
        }
    }
}
