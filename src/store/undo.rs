//! The undo journal.
//!
//! Each mutation is appended as a block of lines:
//!
//! ```text
//! time 1700000000
//! old [..]        (absent for a creation)
//! new [..]        (absent for a removal)
//! ---
//! ```
//!
//! Entries are only ever appended, and only the newest one is ever removed.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use super::file::{Category, TaskFile};
use super::format::{self, LineError};
use crate::core::task::Task;
use crate::error::{Error, Result};

const SEPARATOR: &str = "---";

/// One reversible change: the record before and after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoEntry {
    pub before: Option<Task>,
    pub after: Option<Task>,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub category: Category,
}

/// One attribute that differs between the two sides of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeChange {
    pub name: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

impl UndoEntry {
    fn new(before: Option<Task>, after: Option<Task>, sequence: u64, timestamp: DateTime<Utc>) -> Self {
        let category = before
            .as_ref()
            .or(after.as_ref())
            .map(|t| Category::for_status(t.status()))
            .unwrap_or(Category::Pending);
        Self {
            before,
            after,
            sequence,
            timestamp,
            category,
        }
    }

    pub fn is_creation(&self) -> bool {
        self.before.is_none()
    }

    pub fn is_removal(&self) -> bool {
        self.after.is_none()
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.after.as_ref().or(self.before.as_ref()).and_then(Task::uuid)
    }

    /// Attributes that changed, sorted by name. The uuid never counts.
    pub fn changes(&self) -> Vec<AttributeChange> {
        let empty = Task::default();
        let before = self.before.as_ref().unwrap_or(&empty);
        let after = self.after.as_ref().unwrap_or(&empty);

        let mut names: Vec<&String> = before.data.keys().chain(after.data.keys()).collect();
        names.sort();
        names.dedup();

        names
            .into_iter()
            .filter(|name| name.as_str() != "uuid")
            .filter_map(|name| {
                let old = before.get(name).filter(|v| !v.is_empty());
                let new = after.get(name).filter(|v| !v.is_empty());
                (old != new).then(|| AttributeChange {
                    name: name.clone(),
                    before: old.map(String::from),
                    after: new.map(String::from),
                })
            })
            .collect()
    }

    fn to_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("time {}", self.timestamp.timestamp())];
        if let Some(before) = &self.before {
            lines.push(format!("old {}", format::compose_f4(before)));
        }
        if let Some(after) = &self.after {
            lines.push(format!("new {}", format::compose_f4(after)));
        }
        lines.push(SEPARATOR.to_string());
        lines
    }
}

/// The journal and the file backing it.
#[derive(Debug)]
pub struct UndoJournal {
    file: TaskFile,
    // Entry count, known once the file has been scanned.
    count: Option<usize>,
}

impl UndoJournal {
    pub fn new(file: TaskFile) -> Self {
        Self { file, count: None }
    }

    pub fn file(&self) -> &TaskFile {
        &self.file
    }

    /// Drop cached lines and the entry count, staged entries included.
    pub fn invalidate(&mut self) {
        self.file.invalidate();
        self.count = None;
    }

    /// Append an entry for a change. At least one side must be present.
    pub fn record(&mut self, before: Option<&Task>, after: Option<&Task>) -> Result<UndoEntry> {
        debug_assert!(before.is_some() || after.is_some());
        let count = self.len()?;
        let sequence = count as u64 + 1;
        // The journal keeps whole seconds.
        let now = Utc::now();
        let timestamp = Utc.timestamp_opt(now.timestamp(), 0).single().unwrap_or(now);
        let entry = UndoEntry::new(before.cloned(), after.cloned(), sequence, timestamp);
        for line in entry.to_lines() {
            self.file.add_line(line);
        }
        self.count = Some(count + 1);
        log::debug!("Journaled change #{} to {:?}", sequence, entry.uuid());
        Ok(entry)
    }

    pub fn entries(&mut self) -> Result<Vec<UndoEntry>> {
        let lines = self.file.lines()?;
        Ok(parse_entries(&lines, self.file.path())?
            .into_iter()
            .map(|(entry, _)| entry)
            .collect())
    }

    pub fn len(&mut self) -> Result<usize> {
        if let Some(count) = self.count {
            return Ok(count);
        }
        let lines = self.file.lines()?;
        let count = lines.iter().filter(|l| l.trim() == SEPARATOR).count();
        self.count = Some(count);
        Ok(count)
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn last(&mut self) -> Result<Option<UndoEntry>> {
        Ok(self.entries()?.pop())
    }

    /// Remove the newest entry. The journal file is rewritten on commit.
    pub fn pop(&mut self) -> Result<Option<UndoEntry>> {
        let mut lines = self.file.lines()?;
        let mut entries = parse_entries(&lines, self.file.path())?;
        let Some((entry, start)) = entries.pop() else {
            self.count = Some(0);
            return Ok(None);
        };
        lines.truncate(start);
        self.file.set_lines(lines);
        self.count = Some(entries.len());
        Ok(Some(entry))
    }

    pub fn commit(&mut self) -> Result<()> {
        self.file.commit()
    }
}

/// Parse journal lines into entries, each paired with its first line index.
fn parse_entries(lines: &[String], path: &Path) -> Result<Vec<(UndoEntry, usize)>> {
    let parse_error = |index: usize, message: String| Error::Parse {
        file: path.to_path_buf(),
        line: index + 1,
        message,
    };
    let parse_task = |index: usize, text: &str| {
        format::parse_line(text).map_err(|e| match e {
            LineError::Malformed(message) => parse_error(index, message),
            LineError::Obsolete(version) => Error::UnsupportedFormat {
                file: path.to_path_buf(),
                line: index + 1,
                version,
            },
        })
    };

    let mut entries = Vec::new();
    let mut start = None;
    let mut timestamp = None;
    let mut before = None;
    let mut after = None;

    for (index, line) in lines.iter().enumerate() {
        let line = line.trim_end();
        if let Some(epoch) = line.strip_prefix("time ") {
            if start.is_some() {
                return Err(parse_error(index, "Undo entry is missing its separator".into()));
            }
            let epoch: i64 = epoch
                .trim()
                .parse()
                .map_err(|_| parse_error(index, format!("Invalid undo timestamp '{epoch}'")))?;
            timestamp = Utc.timestamp_opt(epoch, 0).single();
            start = Some(index);
        } else if let Some(record) = line.strip_prefix("old ") {
            before = Some(parse_task(index, record)?);
        } else if let Some(record) = line.strip_prefix("new ") {
            after = Some(parse_task(index, record)?);
        } else if line == SEPARATOR {
            let Some(first) = start.take() else {
                return Err(parse_error(index, "Undo separator without an entry".into()));
            };
            if before.is_none() && after.is_none() {
                return Err(parse_error(index, "Undo entry records no change".into()));
            }
            let when = timestamp.take().unwrap_or_else(Utc::now);
            let sequence = entries.len() as u64 + 1;
            entries.push((UndoEntry::new(before.take(), after.take(), sequence, when), first));
        } else {
            return Err(parse_error(index, "Unrecognized line in undo journal".into()));
        }
    }

    if start.is_some() {
        return Err(parse_error(lines.len().saturating_sub(1), "Truncated undo entry".into()));
    }
    Ok(entries)
}
