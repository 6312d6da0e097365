//! Parsing of shell command lines.

use strata::Key;
use strata::Value;

use crate::errors::ShellError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CreateTable { kind: String, name: String },
    Begin,
    Commit,
    Abort,
    Insert { table: String, key: Key, value: Value },
    Update { table: String, key: Key, value: Value },
    Delete { table: String, key: Key },
    Find { table: String, key: Key },
    Select { table: String, range: Option<(Key, Key)> },
    Pretty { table: String },
    Lock { table: String, key: Key },
    Checkpoint,
    Tables,
    Crash,
    Quit,
}

/// Parses one line. Blank lines and `#` comments yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, ShellError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let words: Vec<&str> = line.split_whitespace().collect();
    let lowered = words[0].to_ascii_lowercase();

    let command = match (lowered.as_str(), &words[1..]) {
        ("create", [kind, table_word, name]) if table_word.eq_ignore_ascii_case("table") => {
            Command::CreateTable {
                kind: kind.to_ascii_lowercase(),
                name: name.to_string(),
            }
        }
        ("transaction", [action]) => match action.to_ascii_lowercase().as_str() {
            "begin" => Command::Begin,
            "commit" => Command::Commit,
            other => return Err(ShellError::Parse(format!("unknown transaction action {other:?}"))),
        },
        ("abort", []) => Command::Abort,
        ("insert", [table, key, value]) => Command::Insert {
            table: table.to_string(),
            key: number(key)?,
            value: number(value)?,
        },
        ("update", [table, key, value]) => Command::Update {
            table: table.to_string(),
            key: number(key)?,
            value: number(value)?,
        },
        ("delete", [table, key]) => Command::Delete {
            table: table.to_string(),
            key: number(key)?,
        },
        ("find", [table, key]) => Command::Find {
            table: table.to_string(),
            key: number(key)?,
        },
        ("select", [table]) => Command::Select {
            table: table.to_string(),
            range: None,
        },
        ("select", [table, lo, hi]) => Command::Select {
            table: table.to_string(),
            range: Some((number(lo)?, number(hi)?)),
        },
        ("pretty", [table]) => Command::Pretty {
            table: table.to_string(),
        },
        ("lock", [table, key]) => Command::Lock {
            table: table.to_string(),
            key: number(key)?,
        },
        ("checkpoint", []) => Command::Checkpoint,
        ("tables", []) => Command::Tables,
        ("crash", []) => Command::Crash,
        ("quit" | "exit", []) => Command::Quit,
        _ => return Err(ShellError::Parse(format!("cannot parse {line:?}"))),
    };
    Ok(Some(command))
}

fn number(word: &str) -> Result<i64, ShellError> {
    word.parse()
        .map_err(|_| ShellError::Parse(format!("{word:?} is not an integer")))
}
