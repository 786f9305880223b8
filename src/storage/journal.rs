//! Line format of the store index.
//!
//! ```text
//! pixtier.journal
//! 1
//! <schema version>
//! 1
//!
//! DIRTY 3400330d1dfc7f3f7f4b8d4d803dfcf6
//! CLEAN 3400330d1dfc7f3f7f4b8d4d803dfcf6 832
//! READ 3400330d1dfc7f3f7f4b8d4d803dfcf6
//! REMOVE 3400330d1dfc7f3f7f4b8d4d803dfcf6
//! ```
//!
//! A `DIRTY` line opens a write; it is always followed by `CLEAN` (committed)
//! or `REMOVE` (aborted). A `DIRTY` with no follow-up means the process died
//! mid-write and the staged data is discarded on the next open. An
//! unparseable final line is what a crash during an append leaves behind and
//! is dropped; an unparseable line anywhere else makes the index corrupt.

use std::fmt;

use super::error::StorageError;
use crate::constants::{
    JOURNAL_FILE, JOURNAL_FORMAT_VERSION, JOURNAL_MAGIC, JOURNAL_VALUE_COUNT, MAX_KEY_LEN,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JournalOp {
    Dirty(String),
    Clean(String, u64),
    Remove(String),
    Read(String),
}

impl JournalOp {
    pub(crate) fn parse(line: &str) -> Result<Self, StorageError> {
        let corrupt = || StorageError::CorruptJournal(line.to_string());
        let mut parts = line.split(' ');
        let op = parts.next().ok_or_else(corrupt)?;
        let key = parts.next().ok_or_else(corrupt)?;
        if !is_valid_key(key) {
            return Err(corrupt());
        }
        let key = key.to_string();

        let parsed = match op {
            "DIRTY" => JournalOp::Dirty(key),
            "REMOVE" => JournalOp::Remove(key),
            "READ" => JournalOp::Read(key),
            "CLEAN" => {
                let size = parts
                    .next()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(corrupt)?;
                JournalOp::Clean(key, size)
            }
            _ => return Err(corrupt()),
        };

        if parts.next().is_some() {
            return Err(corrupt());
        }
        Ok(parsed)
    }
}

impl fmt::Display for JournalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalOp::Dirty(key) => write!(f, "DIRTY {}", key),
            JournalOp::Clean(key, size) => write!(f, "CLEAN {} {}", key, size),
            JournalOp::Remove(key) => write!(f, "REMOVE {}", key),
            JournalOp::Read(key) => write!(f, "READ {}", key),
        }
    }
}

/// Header lines, including the blank separator.
pub(crate) fn header(schema_version: u32) -> String {
    format!(
        "{}\n{}\n{}\n{}\n\n",
        JOURNAL_MAGIC, JOURNAL_FORMAT_VERSION, schema_version, JOURNAL_VALUE_COUNT
    )
}

/// Outcome of reading an index file.
#[derive(Debug)]
pub(crate) enum Replay {
    /// The header matches; operations follow in file order. `torn` holds a
    /// final line that was cut short and skipped.
    Ops {
        ops: Vec<JournalOp>,
        torn: Option<String>,
    },
    /// Written by another schema version or index format.
    Incompatible(String),
}

pub(crate) fn replay(contents: &str, schema_version: u32) -> Result<Replay, StorageError> {
    let mut lines = contents.lines();
    let expected = [
        JOURNAL_MAGIC.to_string(),
        JOURNAL_FORMAT_VERSION.to_string(),
        schema_version.to_string(),
        JOURNAL_VALUE_COUNT.to_string(),
        String::new(),
    ];
    for want in &expected {
        match lines.next() {
            Some(got) if got == want => {}
            Some(got) => {
                return Ok(Replay::Incompatible(format!(
                    "expected header line {:?}, found {:?}",
                    want, got
                )))
            }
            None => return Ok(Replay::Incompatible("truncated header".into())),
        }
    }

    let body: Vec<&str> = lines.filter(|line| !line.is_empty()).collect();
    let mut ops = Vec::with_capacity(body.len());
    let mut torn = None;
    for (i, line) in body.iter().enumerate() {
        match JournalOp::parse(line) {
            Ok(op) => ops.push(op),
            Err(_) if i + 1 == body.len() => torn = Some(line.to_string()),
            Err(e) => return Err(e),
        }
    }
    Ok(Replay::Ops { ops, torn })
}

/// Keys double as file names: lowercase ASCII letters, digits, `_` and `-`.
/// The index file's own name is reserved.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key != JOURNAL_FILE
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}
