use std::collections::HashMap;

use uuid::Uuid;

use crate::core::task::Task;

/// Short-lived numeric ids for pending and waiting tasks.
///
/// Ids follow the order of records in the pending file, starting at 1, and
/// are rebuilt from scratch every time that file is (re)loaded. They are
/// never persisted, so two invocations only agree on them while the file is
/// unchanged.
#[derive(Debug)]
pub struct IdResolver {
    id_to_uuid: HashMap<u32, Uuid>,
    uuid_to_id: HashMap<Uuid, u32>,
    next: u32,
}

impl Default for IdResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl IdResolver {
    pub fn new() -> Self {
        Self {
            id_to_uuid: HashMap::new(),
            uuid_to_id: HashMap::new(),
            next: 1,
        }
    }

    /// Renumber `tasks` in order, writing the id back into each record.
    pub fn rebuild(&mut self, tasks: &mut [Task]) {
        self.clear();
        for task in tasks.iter_mut() {
            task.id = None;
            self.assign(task);
        }
    }

    /// Hand the next id to a pending or waiting task that does not have one.
    pub fn assign(&mut self, task: &mut Task) -> Option<u32> {
        if !task.status().has_id() {
            task.id = None;
            return None;
        }
        let uuid = task.uuid()?;
        if let Some(&existing) = self.uuid_to_id.get(&uuid) {
            task.id = Some(existing);
            return Some(existing);
        }

        let id = self.next_id();
        self.id_to_uuid.insert(id, uuid);
        self.uuid_to_id.insert(uuid, id);
        task.id = Some(id);
        Some(id)
    }

    pub fn clear(&mut self) {
        self.id_to_uuid.clear();
        self.uuid_to_id.clear();
        self.next = 1;
    }

    pub fn id(&self, uuid: &Uuid) -> Option<u32> {
        self.uuid_to_id.get(uuid).copied()
    }

    pub fn uuid(&self, id: u32) -> Option<Uuid> {
        self.id_to_uuid.get(&id).copied()
    }

    /// Claim the next unused id.
    pub fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }

    /// The most recently handed out id, or zero when none were.
    pub fn latest_id(&self) -> u32 {
        self.next.saturating_sub(1)
    }
}
