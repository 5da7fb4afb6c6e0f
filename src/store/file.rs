use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::format::{self, LineError};
use super::ids::IdResolver;
use crate::core::task::{Status, Task};
use crate::error::{Error, Result};

/// The data files that make up a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Pending,
    Completed,
    Undo,
    Backlog,
    SyncKey,
}

impl Category {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Pending => "pending.data",
            Self::Completed => "completed.data",
            Self::Undo => "undo.data",
            Self::Backlog => "backlog.data",
            Self::SyncKey => "synckey.data",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Undo => "undo",
            Self::Backlog => "backlog",
            Self::SyncKey => "synckey",
        }
    }

    /// Which record store a task with this status lives in.
    pub fn for_status(status: Status) -> Self {
        if status.is_done() {
            Self::Completed
        } else {
            Self::Pending
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Bookkeeping counters for one file, logged before a commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileStats {
    pub tasks: usize,
    pub added: usize,
    pub modified: usize,
    pub purged: usize,
    pub lines: usize,
    pub added_lines: usize,
    pub dirty: bool,
    pub read_only: bool,
}

impl fmt::Display for FileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} T{:04}+{:03}~{:03}-{:03} L{:04}+{:03}",
            if self.read_only { "r-" } else { "rw" },
            if self.dirty { "O" } else { "-" },
            self.tasks,
            self.added,
            self.modified,
            self.purged,
            self.lines,
            self.added_lines
        )
    }
}

/// One category's data file.
///
/// Raw lines and parsed records are cached separately and loaded lazily on
/// first use. Changes are staged in memory (added records, modified records,
/// purged uuids, added raw lines) until `commit`, which appends when it can
/// and otherwise rewrites the file through a temporary sibling.
#[derive(Debug)]
pub struct TaskFile {
    category: Category,
    path: PathBuf,
    lines: Option<Vec<String>>,
    tasks: Option<Vec<Task>>,
    added_tasks: Vec<Task>,
    modified_tasks: Vec<Task>,
    purged: HashSet<Uuid>,
    added_lines: Vec<String>,
    rewrite: bool,
    ids: Option<IdResolver>,
}

impl TaskFile {
    pub fn new(category: Category, path: impl Into<PathBuf>) -> Self {
        Self {
            category,
            path: path.into(),
            lines: None,
            tasks: None,
            added_tasks: Vec::new(),
            modified_tasks: Vec::new(),
            purged: HashSet::new(),
            added_lines: Vec::new(),
            rewrite: false,
            ids: None,
        }
    }

    /// Give this file's pending and waiting records numeric ids.
    pub fn with_ids(mut self) -> Self {
        self.ids = Some(IdResolver::new());
        self
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Checked against the file on every call. A missing file is writable.
    pub fn read_only(&self) -> bool {
        fs::metadata(&self.path)
            .map(|m| m.permissions().readonly())
            .unwrap_or(false)
    }

    /// Fail now, before anything is written, if `commit` would be refused.
    pub fn ensure_writable(&self) -> Result<()> {
        if self.is_dirty() && self.read_only() {
            return Err(Error::ReadOnly(self.path.clone()));
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        !self.added_tasks.is_empty()
            || !self.modified_tasks.is_empty()
            || !self.purged.is_empty()
            || !self.added_lines.is_empty()
            || self.rewrite
    }

    pub fn is_loaded(&self) -> bool {
        self.tasks.is_some()
    }

    fn load_lines(&mut self) -> Result<()> {
        if self.lines.is_some() {
            return Ok(());
        }
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let lines: Vec<String> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(String::from)
            .collect();
        log::debug!("Read {} lines from {}", lines.len(), self.path.display());
        self.lines = Some(lines);
        Ok(())
    }

    /// Parse the file into records, once. A bad line abandons the whole load.
    pub fn load(&mut self) -> Result<()> {
        if self.tasks.is_some() {
            return Ok(());
        }
        self.load_lines()?;

        let lines = self.lines.as_deref().unwrap_or(&[]);
        let mut tasks = Vec::with_capacity(lines.len() + self.added_tasks.len());
        for (index, line) in lines.iter().enumerate() {
            let task = format::parse_line(line).map_err(|e| match e {
                LineError::Malformed(message) => Error::Parse {
                    file: self.path.clone(),
                    line: index + 1,
                    message,
                },
                LineError::Obsolete(version) => Error::UnsupportedFormat {
                    file: self.path.clone(),
                    line: index + 1,
                    version,
                },
            })?;
            tasks.push(task);
        }

        // Records staged before the first load still belong at the end.
        tasks.extend(self.added_tasks.iter().cloned());

        if let Some(ids) = self.ids.as_mut() {
            ids.rebuild(&mut tasks);
        }
        dependency_scan(&mut tasks);
        self.tasks = Some(tasks);
        Ok(())
    }

    /// Recompute the blocked and blocking flags after records moved.
    pub fn scan_dependencies(&mut self) -> Result<()> {
        self.load()?;
        if let Some(tasks) = self.tasks.as_mut() {
            dependency_scan(tasks);
        }
        Ok(())
    }

    pub fn tasks(&mut self) -> Result<&[Task]> {
        self.load()?;
        Ok(self.tasks.as_deref().unwrap_or(&[]))
    }

    /// Raw lines, including staged ones.
    pub fn lines(&mut self) -> Result<Vec<String>> {
        self.load_lines()?;
        let mut lines = self.lines.clone().unwrap_or_default();
        lines.extend(self.added_lines.iter().cloned());
        Ok(lines)
    }

    pub fn invalidate_lines(&mut self) {
        self.lines = None;
    }

    pub fn invalidate_tasks(&mut self) {
        self.tasks = None;
        if let Some(ids) = self.ids.as_mut() {
            ids.clear();
        }
    }

    /// Forget everything, staged changes included.
    pub fn invalidate(&mut self) {
        self.invalidate_lines();
        self.invalidate_tasks();
        self.added_tasks.clear();
        self.modified_tasks.clear();
        self.purged.clear();
        self.added_lines.clear();
        self.rewrite = false;
    }

    fn loaded_tasks(&mut self) -> Result<&mut Vec<Task>> {
        self.load()?;
        Ok(self.tasks.get_or_insert_with(Vec::new))
    }

    pub fn has(&mut self, uuid: &Uuid) -> Result<bool> {
        Ok(self.tasks()?.iter().any(|t| t.uuid().as_ref() == Some(uuid)))
    }

    pub fn get_by_uuid(&mut self, uuid: &Uuid) -> Result<Option<Task>> {
        Ok(self
            .tasks()?
            .iter()
            .find(|t| t.uuid().as_ref() == Some(uuid))
            .cloned())
    }

    /// Lookup by a leading fragment of a uuid. Ambiguous fragments match nothing.
    pub fn get_by_prefix(&mut self, prefix: &str) -> Result<Option<Task>> {
        let prefix = prefix.to_ascii_lowercase();
        let mut matches = self
            .tasks()?
            .iter()
            .filter(|t| t.get("uuid").is_some_and(|u| u.to_ascii_lowercase().starts_with(&prefix)));
        let first = matches.next().cloned();
        if matches.next().is_some() {
            return Ok(None);
        }
        Ok(first)
    }

    pub fn get_by_id(&mut self, id: u32) -> Result<Option<Task>> {
        let Some(uuid) = self.uuid(id)? else {
            return Ok(None);
        };
        self.get_by_uuid(&uuid)
    }

    pub fn id(&mut self, uuid: &Uuid) -> Result<Option<u32>> {
        self.load()?;
        Ok(self.ids.as_ref().and_then(|ids| ids.id(uuid)))
    }

    pub fn uuid(&mut self, id: u32) -> Result<Option<Uuid>> {
        self.load()?;
        Ok(self.ids.as_ref().and_then(|ids| ids.uuid(id)))
    }

    pub fn resolver(&self) -> Option<&IdResolver> {
        self.ids.as_ref()
    }

    pub fn resolver_mut(&mut self) -> Option<&mut IdResolver> {
        self.ids.as_mut()
    }

    /// Renumber after records left or joined this file out of order.
    pub fn renumber(&mut self) -> Result<()> {
        self.load()?;
        if let (Some(ids), Some(tasks)) = (self.ids.as_mut(), self.tasks.as_mut()) {
            ids.rebuild(tasks);
        }
        Ok(())
    }

    /// Stage a new record. Returns it with its id, if it earned one.
    pub fn add(&mut self, mut task: Task) -> Result<Task> {
        let uuid = task
            .uuid()
            .ok_or_else(|| Error::InvalidAttribute {
                name: "uuid".into(),
                value: task.get("uuid").unwrap_or("").to_string(),
            })?;
        if self.has(&uuid)? {
            return Err(Error::DuplicateIdentity { uuid });
        }

        if let Some(ids) = self.ids.as_mut() {
            ids.assign(&mut task);
        } else {
            task.id = None;
        }

        self.loaded_tasks()?.push(task.clone());
        self.added_tasks.push(task.clone());
        Ok(task)
    }

    /// Replace the stored record carrying the same uuid.
    pub fn modify(&mut self, mut task: Task) -> Result<()> {
        let uuid = task.uuid().ok_or_else(|| Error::NotFound(task.identifier()))?;
        let tasks = self.loaded_tasks()?;
        let slot = tasks
            .iter_mut()
            .find(|t| t.uuid() == Some(uuid))
            .ok_or_else(|| Error::NotFound(uuid.to_string()))?;
        task.id = slot.id;
        *slot = task.clone();

        // Not yet on disk: the pending append picks up the new content.
        if let Some(added) = self.added_tasks.iter_mut().find(|t| t.uuid() == Some(uuid)) {
            *added = task;
        } else {
            self.modified_tasks.push(task);
        }
        Ok(())
    }

    /// Drop a record from this file on the next commit.
    pub fn purge(&mut self, uuid: &Uuid) -> Result<Task> {
        let tasks = self.loaded_tasks()?;
        let index = tasks
            .iter()
            .position(|t| t.uuid().as_ref() == Some(uuid))
            .ok_or_else(|| Error::NotFound(uuid.to_string()))?;
        let removed = tasks.remove(index);

        let before = self.added_tasks.len();
        self.added_tasks.retain(|t| t.uuid().as_ref() != Some(uuid));
        if self.added_tasks.len() == before {
            self.purged.insert(*uuid);
        }
        self.modified_tasks.retain(|t| t.uuid().as_ref() != Some(uuid));
        Ok(removed)
    }

    /// Records added or modified since the last commit.
    pub fn staged_tasks(&self) -> impl Iterator<Item = &Task> {
        self.added_tasks.iter().chain(self.modified_tasks.iter())
    }

    pub fn add_line(&mut self, line: impl Into<String>) {
        self.added_lines.push(line.into());
    }

    /// Replace the raw content wholesale; committed as a full rewrite.
    pub fn set_lines(&mut self, lines: Vec<String>) {
        self.lines = Some(lines);
        self.added_lines.clear();
        self.tasks = None;
        self.rewrite = true;
    }

    pub fn stats(&self) -> FileStats {
        FileStats {
            tasks: self.tasks.as_ref().map_or(0, Vec::len),
            added: self.added_tasks.len(),
            modified: self.modified_tasks.len(),
            purged: self.purged.len(),
            lines: self.lines.as_ref().map_or(0, Vec::len),
            added_lines: self.added_lines.len(),
            dirty: self.is_dirty(),
            read_only: self.read_only(),
        }
    }

    /// Write staged changes. Callers hold the database lock.
    pub fn commit(&mut self) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        if self.read_only() {
            return Err(Error::ReadOnly(self.path.clone()));
        }

        let append_only = self.modified_tasks.is_empty() && self.purged.is_empty() && !self.rewrite;
        if append_only {
            let mut written: Vec<String> = self.added_tasks.iter().map(format::compose_f4).collect();
            written.extend(self.added_lines.iter().cloned());
            self.append(&written)?;
            log::debug!("Appended {} lines to {}", written.len(), self.category);
            if let Some(lines) = self.lines.as_mut() {
                lines.extend(written);
            }
        } else {
            let mut content: Vec<String> = match self.tasks.as_ref() {
                Some(tasks) => tasks.iter().map(format::compose_f4).collect(),
                None => self.lines.clone().unwrap_or_default(),
            };
            content.extend(self.added_lines.iter().cloned());
            self.replace(&content)?;
            log::debug!("Rewrote {} with {} lines", self.category, content.len());
            self.lines = Some(content);
        }

        self.added_tasks.clear();
        self.modified_tasks.clear();
        self.purged.clear();
        self.added_lines.clear();
        self.rewrite = false;
        Ok(())
    }

    fn append(&self, lines: &[String]) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        for line in lines {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
        Ok(())
    }

    /// Rewrite through a temporary sibling so readers never see a half file.
    fn replace(&self, lines: &[String]) -> Result<()> {
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        {
            let mut file = File::create(&tmp)?;
            for line in lines {
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Flag unfinished tasks that wait on another unfinished task in the same
/// file, and the tasks they wait on.
fn dependency_scan(tasks: &mut [Task]) {
    let index: HashMap<Uuid, usize> = tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.status().is_active())
        .filter_map(|(i, t)| Some((t.uuid()?, i)))
        .collect();

    let mut edges = Vec::new();
    for (left, task) in tasks.iter().enumerate() {
        if task.status().is_done() {
            continue;
        }
        edges.extend(task.depends().iter().filter_map(|dep| index.get(dep)).map(|&right| (left, right)));
    }

    for task in tasks.iter_mut() {
        task.is_blocked = false;
        task.is_blocking = false;
    }
    for (left, right) in edges {
        tasks[left].is_blocked = true;
        tasks[right].is_blocking = true;
    }
}
