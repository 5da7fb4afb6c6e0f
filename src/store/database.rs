use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::file::{Category, FileStats, TaskFile};
use super::format;
use super::lock::DataLock;
use super::undo::{UndoEntry, UndoJournal};
use crate::core::task::{Status, Task};
use crate::error::{Error, Result};

/// What gc does with deleted tasks it finds in the pending file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GcPolicy {
    /// Move them to the completed file like completed tasks.
    #[default]
    Archive,
    /// Drop them outright.
    DropDeleted,
}

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub location: PathBuf,
    pub locking: bool,
    pub lock_timeout: Duration,
    pub gc: bool,
    pub gc_policy: GcPolicy,
}

impl DatabaseOptions {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            locking: true,
            lock_timeout: Duration::from_secs(10),
            gc: true,
            gc_policy: GcPolicy::Archive,
        }
    }
}

/// A way of naming a task on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRef {
    Id(u32),
    Uuid(Uuid),
    /// A leading fragment of a uuid, at least eight characters.
    Prefix(String),
}

impl FromStr for TaskRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(id) = s.parse::<u32>() {
            if id > 0 {
                return Ok(Self::Id(id));
            }
        }
        if let Ok(uuid) = Uuid::parse_str(s) {
            return Ok(Self::Uuid(uuid));
        }
        if s.len() >= 8 && s.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Ok(Self::Prefix(s.to_string()));
        }
        Err(Error::NotFound(s.to_string()))
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Uuid(uuid) => write!(f, "{uuid}"),
            Self::Prefix(prefix) => f.write_str(prefix),
        }
    }
}

/// Tasks relocated or rewritten by a gc pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub archived: usize,
    pub dropped: usize,
    pub revived: usize,
    pub woken: usize,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        self.archived + self.dropped + self.revived + self.woken == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoOutcome {
    /// The journal was empty; nothing changed.
    Empty,
    Reverted(UndoEntry),
}

/// The task database: every data file, opened together and changed together.
///
/// Mutations are staged in memory and journaled as they happen. `commit`
/// writes every dirty file under one held lock, in the order pending,
/// completed, backlog, undo, sync key.
#[derive(Debug)]
pub struct Database {
    options: DatabaseOptions,
    pending: TaskFile,
    completed: TaskFile,
    undo: UndoJournal,
    backlog: TaskFile,
    sync_key: TaskFile,
    lock: Option<DataLock>,
    changes: Vec<Task>,
}

impl Database {
    /// Target the data files under `options.location`. Nothing is read yet.
    pub fn open(options: DatabaseOptions) -> Result<Self> {
        std::fs::create_dir_all(&options.location)?;
        let path = |category: Category| options.location.join(category.file_name());

        let pending = TaskFile::new(Category::Pending, path(Category::Pending)).with_ids();
        let completed = TaskFile::new(Category::Completed, path(Category::Completed));
        let undo = UndoJournal::new(TaskFile::new(Category::Undo, path(Category::Undo)));
        let backlog = TaskFile::new(Category::Backlog, path(Category::Backlog));
        let sync_key = TaskFile::new(Category::SyncKey, path(Category::SyncKey));

        log::debug!("Opened task database at {}", options.location.display());
        Ok(Self {
            options,
            pending,
            completed,
            undo,
            backlog,
            sync_key,
            lock: None,
            changes: Vec::new(),
        })
    }

    pub fn location(&self) -> &Path {
        &self.options.location
    }

    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    pub fn lock(&mut self) -> Result<()> {
        if self.lock.is_some() {
            return Ok(());
        }
        let lock = DataLock::acquire(&self.options.location.join("lock"), self.options.lock_timeout)?;

        // Whatever was read before the lock may have changed since.
        for file in [&mut self.pending, &mut self.completed, &mut self.backlog, &mut self.sync_key] {
            if !file.is_dirty() {
                file.invalidate();
            }
        }
        if !self.undo.file().is_dirty() {
            self.undo.invalidate();
        }

        self.lock = Some(lock);
        Ok(())
    }

    pub fn unlock(&mut self) {
        if self.lock.take().is_some() {
            log::debug!("Unlocked {}", self.options.location.display());
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    fn lock_for_mutation(&mut self) -> Result<()> {
        if self.options.locking {
            self.lock()?;
        }
        Ok(())
    }

    fn records_mut(&mut self, category: Category) -> &mut TaskFile {
        match category {
            Category::Completed => &mut self.completed,
            _ => &mut self.pending,
        }
    }

    pub fn read_only(&self) -> bool {
        self.files().iter().any(|f| f.read_only())
    }

    fn backlog_uuids(&mut self) -> Result<HashSet<Uuid>> {
        let mut uuids = HashSet::new();
        for line in self.backlog.lines()? {
            match format::parse_line(&line) {
                Ok(task) => uuids.extend(task.uuid()),
                Err(e) => log::warn!("Skipping unreadable backlog line: {:?}", e),
            }
        }
        Ok(uuids)
    }

    /// True when no stored or queued task already uses `uuid`.
    pub fn verify_unique_uuid(&mut self, uuid: &Uuid) -> Result<bool> {
        if self.pending.has(uuid)? || self.completed.has(uuid)? {
            return Ok(false);
        }
        Ok(!self.backlog_uuids()?.contains(uuid))
    }

    /// Stage a new task, filling in its uuid and defaults.
    pub fn add(&mut self, task: Task) -> Result<Task> {
        self.add_with(task, true)
    }

    /// `add` for tasks that arrive from elsewhere (a sync peer, an import).
    /// With `add_to_backlog` off, no defaults are applied and nothing is
    /// queued for sync. The change is journaled either way.
    pub fn add_with(&mut self, mut task: Task, add_to_backlog: bool) -> Result<Task> {
        self.lock_for_mutation()?;
        task.validate(add_to_backlog)?;
        let uuid = task.uuid().ok_or_else(|| Error::NotFound(task.identifier()))?;

        if !self.verify_unique_uuid(&uuid)? {
            return Err(Error::DuplicateIdentity { uuid });
        }

        let category = Category::for_status(task.status());
        let stored = self.records_mut(category).add(task)?;
        self.undo.record(None, Some(&stored))?;
        if add_to_backlog {
            self.backlog.add_line(format::compose_json(&stored));
        }

        log::info!("Added task {} to {}", stored.identifier(), category);
        Ok(stored)
    }

    /// Replace `old` with `new`. The stored copy is the journal's before-image.
    pub fn modify(&mut self, old: &Task, new: Task) -> Result<()> {
        self.modify_with(old, new, true)
    }

    /// `modify` without the local bookkeeping when `add_to_backlog` is off:
    /// `modified` is kept as given and no backlog line is queued.
    pub fn modify_with(&mut self, old: &Task, mut new: Task, add_to_backlog: bool) -> Result<()> {
        self.lock_for_mutation()?;
        let uuid = old.uuid().ok_or_else(|| Error::NotFound(old.identifier()))?;
        if new.uuid() != Some(uuid) {
            return Err(Error::InvalidAttribute {
                name: "uuid".into(),
                value: new.get("uuid").unwrap_or("").to_string(),
            });
        }

        let (category, original) = match self.pending.get_by_uuid(&uuid)? {
            Some(task) => (Category::Pending, task),
            None => match self.completed.get_by_uuid(&uuid)? {
                Some(task) => (Category::Completed, task),
                None => return Err(Error::NotFound(uuid.to_string())),
            },
        };

        new.validate(false)?;
        if new == original {
            log::debug!("Task {} unchanged", uuid);
            return Ok(());
        }
        if add_to_backlog {
            new.set_as_now("modified");
        }

        self.records_mut(category).modify(new.clone())?;
        self.undo.record(Some(&original), Some(&new))?;
        if add_to_backlog {
            self.backlog.add_line(format::compose_json(&new));
        }

        log::info!("Modified task {} in {}", original.identifier(), category);
        Ok(())
    }

    /// Permanently remove a deleted task from the completed file.
    pub fn purge(&mut self, uuid: &Uuid) -> Result<Task> {
        self.lock_for_mutation()?;
        let task = self
            .completed
            .get_by_uuid(uuid)?
            .ok_or_else(|| Error::NotFound(uuid.to_string()))?;
        if task.status() != Status::Deleted {
            return Err(Error::InvalidAttribute {
                name: "status".into(),
                value: task.status().as_keyword().to_string(),
            });
        }

        self.completed.purge(uuid)?;
        self.undo.record(Some(&task), None)?;
        log::info!("Purged task {}", uuid);
        Ok(task)
    }

    /// Move tasks into the file their status belongs in, and wake waiting
    /// tasks whose wait date has passed. Running it twice changes nothing
    /// the second time.
    pub fn gc(&mut self) -> Result<GcReport> {
        self.lock_for_mutation()?;
        let mut report = GcReport::default();
        let now = Utc::now();

        let stale: Vec<Task> = self
            .pending
            .tasks()?
            .iter()
            .filter(|t| t.status().is_done())
            .cloned()
            .collect();
        for task in stale {
            let Some(uuid) = task.uuid() else { continue };
            self.pending.purge(&uuid)?;
            if task.status() == Status::Deleted && self.options.gc_policy == GcPolicy::DropDeleted {
                report.dropped += 1;
            } else {
                self.completed.add(task)?;
                report.archived += 1;
            }
        }

        let expired: Vec<Task> = self
            .pending
            .tasks()?
            .iter()
            .filter(|t| t.status() == Status::Waiting && t.get_date("wait").is_some_and(|w| w <= now))
            .cloned()
            .collect();
        for mut task in expired {
            task.remove("wait");
            task.set_status(Status::Pending);
            self.pending.modify(task)?;
            report.woken += 1;
        }

        let reopened: Vec<Task> = self
            .completed
            .tasks()?
            .iter()
            .filter(|t| t.status().is_active())
            .cloned()
            .collect();
        for task in reopened {
            let Some(uuid) = task.uuid() else { continue };
            self.completed.purge(&uuid)?;
            self.pending.add(task)?;
            report.revived += 1;
        }

        self.pending.renumber()?;
        self.pending.scan_dependencies()?;
        self.completed.scan_dependencies()?;
        if !report.is_empty() {
            log::info!(
                "gc: {} archived, {} dropped, {} revived, {} woken",
                report.archived,
                report.dropped,
                report.revived,
                report.woken
            );
        }
        Ok(report)
    }

    fn is_dirty(&self) -> bool {
        self.files().iter().any(|f| f.is_dirty())
    }

    fn files(&self) -> [&TaskFile; 5] {
        [&self.pending, &self.completed, &self.backlog, self.undo.file(), &self.sync_key]
    }

    /// Write every staged change, then release the lock.
    ///
    /// Every file is checked for writability before the first one is
    /// touched, so a refused commit leaves the data files as they were.
    pub fn commit(&mut self) -> Result<()> {
        if !self.is_dirty() {
            self.changes.clear();
            self.unlock();
            return Ok(());
        }
        self.lock_for_mutation()?;

        if self.options.gc {
            self.gc()?;
        }

        for file in self.files() {
            file.ensure_writable()?;
        }

        for (category, stats) in self.stats() {
            log::debug!("{:>10} {}", category.label(), stats);
        }

        self.changes = self
            .pending
            .staged_tasks()
            .chain(self.completed.staged_tasks())
            .cloned()
            .collect();

        self.pending.commit()?;
        self.completed.commit()?;
        self.backlog.commit()?;
        self.undo.commit()?;
        self.sync_key.commit()?;
        self.pending.renumber()?;

        self.unlock();
        log::debug!("Committed {}", self.options.location.display());
        Ok(())
    }

    /// Revert the most recent journaled change and commit the result.
    pub fn undo(&mut self) -> Result<UndoOutcome> {
        self.lock_for_mutation()?;
        let Some(entry) = self.undo.pop()? else {
            log::info!("Nothing to undo");
            self.unlock();
            return Ok(UndoOutcome::Empty);
        };
        let uuid = entry
            .uuid()
            .ok_or_else(|| Error::NotFound(format!("undo entry #{}", entry.sequence)))?;

        match &entry.before {
            Some(before) => {
                let target = Category::for_status(before.status());
                if self.locate(&uuid)? == Some(target) {
                    // Same file: overwrite in place so ids stay put.
                    self.records_mut(target).modify(before.clone())?;
                } else {
                    self.remove_anywhere(&uuid)?;
                    self.records_mut(target).add(before.clone())?;
                }
                self.backlog.add_line(format::compose_json(before));
            }
            None => {
                self.remove_anywhere(&uuid)?;
                self.drop_backlog_entry(&uuid)?;
            }
        }

        self.commit()?;
        log::info!("Reverted change #{} to task {}", entry.sequence, uuid);
        Ok(UndoOutcome::Reverted(entry))
    }

    fn locate(&mut self, uuid: &Uuid) -> Result<Option<Category>> {
        if self.pending.has(uuid)? {
            return Ok(Some(Category::Pending));
        }
        if self.completed.has(uuid)? {
            return Ok(Some(Category::Completed));
        }
        Ok(None)
    }

    fn remove_anywhere(&mut self, uuid: &Uuid) -> Result<Option<Task>> {
        if self.pending.has(uuid)? {
            return self.pending.purge(uuid).map(Some);
        }
        if self.completed.has(uuid)? {
            return self.completed.purge(uuid).map(Some);
        }
        Ok(None)
    }

    /// Forget the newest queued backlog line for a task that never existed.
    fn drop_backlog_entry(&mut self, uuid: &Uuid) -> Result<()> {
        let mut lines = self.backlog.lines()?;
        let position = lines.iter().rposition(|line| {
            format::parse_line(line).is_ok_and(|task| task.uuid().as_ref() == Some(uuid))
        });
        if let Some(index) = position {
            lines.remove(index);
            self.backlog.set_lines(lines);
        }
        Ok(())
    }

    pub fn get(&mut self, reference: &TaskRef) -> Result<Option<Task>> {
        match reference {
            TaskRef::Id(id) => self.get_by_id(*id),
            TaskRef::Uuid(uuid) => self.get_by_uuid(uuid),
            TaskRef::Prefix(prefix) => match self.pending.get_by_prefix(prefix)? {
                Some(task) => Ok(Some(task)),
                None => self.completed.get_by_prefix(prefix),
            },
        }
    }

    pub fn get_by_id(&mut self, id: u32) -> Result<Option<Task>> {
        self.pending.get_by_id(id)
    }

    pub fn get_by_uuid(&mut self, uuid: &Uuid) -> Result<Option<Task>> {
        match self.pending.get_by_uuid(uuid)? {
            Some(task) => Ok(Some(task)),
            None => self.completed.get_by_uuid(uuid),
        }
    }

    pub fn id(&mut self, uuid: &Uuid) -> Result<Option<u32>> {
        self.pending.id(uuid)
    }

    pub fn uuid(&mut self, id: u32) -> Result<Option<Uuid>> {
        self.pending.uuid(id)
    }

    /// Claim the next unused id for this invocation.
    pub fn next_id(&mut self) -> Result<u32> {
        self.pending.load()?;
        Ok(self.pending.resolver_mut().map_or(0, |ids| ids.next_id()))
    }

    pub fn latest_id(&mut self) -> Result<u32> {
        self.pending.load()?;
        Ok(self.pending.resolver().map_or(0, |ids| ids.latest_id()))
    }

    /// Active tasks that share `task`'s parent, excluding `task` itself.
    pub fn siblings(&mut self, task: &Task) -> Result<Vec<Task>> {
        let Some(parent) = task.parent() else {
            return Ok(Vec::new());
        };
        let own = task.uuid();
        Ok(self
            .pending
            .tasks()?
            .iter()
            .filter(|t| t.uuid() != own && t.status().is_active() && t.parent() == Some(parent))
            .cloned()
            .collect())
    }

    /// Every task, finished or not, whose parent is `task`.
    pub fn children(&mut self, task: &Task) -> Result<Vec<Task>> {
        let Some(uuid) = task.get("uuid").filter(|u| !u.is_empty()) else {
            return Ok(Vec::new());
        };
        self.filter(|t| t.parent() == Some(uuid))
    }

    pub fn pending_tasks(&mut self) -> Result<Vec<Task>> {
        Ok(self.pending.tasks()?.to_vec())
    }

    pub fn completed_tasks(&mut self) -> Result<Vec<Task>> {
        Ok(self.completed.tasks()?.to_vec())
    }

    pub fn all_tasks(&mut self) -> Result<Vec<Task>> {
        let mut all = self.pending_tasks()?;
        all.extend(self.completed.tasks()?.iter().cloned());
        Ok(all)
    }

    /// Every task the predicate accepts, pending first.
    pub fn filter<F>(&mut self, matches: F) -> Result<Vec<Task>>
    where
        F: Fn(&Task) -> bool,
    {
        Ok(self.all_tasks()?.into_iter().filter(|t| matches(t)).collect())
    }

    /// Tasks the last commit added or modified, gc moves included.
    pub fn changes(&self) -> &[Task] {
        &self.changes
    }

    pub fn journal(&mut self) -> &mut UndoJournal {
        &mut self.undo
    }

    /// Queued change records, uninterpreted.
    pub fn backlog(&mut self) -> Result<Vec<String>> {
        self.backlog.lines()
    }

    pub fn sync_key(&mut self) -> Result<Option<String>> {
        Ok(self.sync_key.lines()?.pop())
    }

    pub fn set_sync_key(&mut self, key: impl Into<String>) -> Result<()> {
        self.lock_for_mutation()?;
        self.sync_key.set_lines(vec![key.into()]);
        Ok(())
    }

    pub fn stats(&self) -> Vec<(Category, FileStats)> {
        self.files().iter().map(|f| (f.category(), f.stats())).collect()
    }
}
