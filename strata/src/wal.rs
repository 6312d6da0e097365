//! The write-ahead log.
//!
//! One record per line: the CRC32 of the JSON body as 8 hex digits, a space,
//! then the JSON encoding of a [`LogRecord`]. A record's LSN is the byte
//! offset of its line.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::lock_manager::Resource;
use crate::{Key, TxnId, Value};

pub type Lsn = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Insert,
    Update,
    Delete,
}

/// One key-level change with its before and after images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    pub txn: TxnId,
    pub table: String,
    pub action: Action,
    pub key: Key,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

impl Edit {
    /// The change that undoes this one.
    pub fn inverse(&self) -> Edit {
        let action = match self.action {
            Action::Insert => Action::Delete,
            Action::Update => Action::Update,
            Action::Delete => Action::Insert,
        };
        Edit {
            txn: self.txn,
            table: self.table.clone(),
            action,
            key: self.key,
            old: self.new,
            new: self.old,
        }
    }

    pub fn resource(&self) -> Resource {
        Resource::new(self.table.clone(), self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    CreateTable { index: String, name: String },
    Begin { txn: TxnId },
    Edit(Edit),
    /// Redo-only undo of the transaction's newest uncompensated edit.
    Compensate(Edit),
    Commit { txn: TxnId },
    /// Marks the end of a rollback.
    Abort { txn: TxnId },
    Checkpoint { id: u64, active: Vec<TxnId> },
}

impl LogRecord {
    pub fn txn(&self) -> Option<TxnId> {
        match self {
            LogRecord::Begin { txn } | LogRecord::Commit { txn } | LogRecord::Abort { txn } => {
                Some(*txn)
            }
            LogRecord::Edit(edit) | LogRecord::Compensate(edit) => Some(edit.txn),
            LogRecord::CreateTable { .. } | LogRecord::Checkpoint { .. } => None,
        }
    }
}

fn encode_line(record: &LogRecord) -> Result<String> {
    let body = serde_json::to_string(record)?;
    Ok(format!("{:08x} {}\n", crc32fast::hash(body.as_bytes()), body))
}

fn decode_line(line: &str) -> Result<LogRecord> {
    let (crc, body) = line
        .split_once(' ')
        .ok_or_else(|| StrataError::Corrupted(format!("log line without checksum: {line:?}")))?;
    let expected = u32::from_str_radix(crc, 16)
        .map_err(|_| StrataError::Corrupted(format!("bad checksum field {crc:?}")))?;
    let actual = crc32fast::hash(body.as_bytes());
    if crc.len() != 8 || expected != actual {
        return Err(StrataError::Corrupted(format!(
            "checksum mismatch: stored {crc}, computed {actual:08x}"
        )));
    }
    Ok(serde_json::from_str(body)?)
}

/// Appends records, syncing each one before returning.
pub struct LogWriter {
    file: File,
    path: PathBuf,
    next_lsn: Lsn,
}

impl LogWriter {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let next_lsn = file.metadata()?.len();
        debug!("opened log {:?} at lsn {}", path, next_lsn);
        Ok(Self {
            file,
            path: path.to_path_buf(),
            next_lsn,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    pub fn append(&mut self, record: &LogRecord) -> Result<Lsn> {
        let line = encode_line(record)?;
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        let lsn = self.next_lsn;
        self.next_lsn += line.len() as u64;
        Ok(lsn)
    }

    /// Cuts the log back to `len` bytes, dropping a torn tail.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.file.sync_all()?;
        self.next_lsn = len;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub lsn: Lsn,
    pub record: LogRecord,
}

#[derive(Debug, Default)]
pub struct LogContents {
    pub entries: Vec<LogEntry>,
    /// Length of the intact prefix.
    pub valid_len: u64,
    /// Whether bytes past `valid_len` were found.
    pub torn_tail: bool,
}

/// Reads every intact record. Damage is tolerated only at the end of the
/// file, where an interrupted append leaves it; a damaged record followed by
/// intact ones is a `RecoveryInconsistency`.
pub fn read_log<P: AsRef<Path>>(path: P) -> Result<LogContents> {
    let path = path.as_ref();
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogContents::default()),
        Err(e) => return Err(e.into()),
    };

    let mut contents = LogContents::default();
    let mut first_damage: Option<(Lsn, String)> = None;
    let mut offset = 0usize;
    while offset < bytes.len() {
        let Some(len) = bytes[offset..].iter().position(|b| *b == b'\n') else {
            // An unterminated last line was never acknowledged.
            first_damage.get_or_insert((offset as Lsn, "unterminated record".to_string()));
            break;
        };
        let line = &bytes[offset..offset + len];
        let decoded = std::str::from_utf8(line)
            .map_err(|e| StrataError::Corrupted(e.to_string()))
            .and_then(decode_line);
        match decoded {
            Ok(record) => {
                if let Some((damaged_at, reason)) = &first_damage {
                    return Err(StrataError::RecoveryInconsistency(format!(
                        "log record at {damaged_at} is damaged ({reason}) but later records are intact"
                    )));
                }
                contents.entries.push(LogEntry {
                    lsn: offset as Lsn,
                    record,
                });
            }
            Err(e) => {
                first_damage.get_or_insert((offset as Lsn, e.to_string()));
            }
        }
        offset += len + 1;
    }

    match first_damage {
        Some((lsn, reason)) => {
            warn!("log {:?} has a torn tail at {}: {}", path, lsn, reason);
            contents.valid_len = lsn;
            contents.torn_tail = true;
        }
        None => contents.valid_len = bytes.len() as u64,
    }
    Ok(contents)
}
