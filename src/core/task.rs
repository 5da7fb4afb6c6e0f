use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Completed,
    Deleted,
    Waiting,
    Recurring,
}

impl Status {
    pub const ALL: &'static [Status] = &[
        Self::Pending,
        Self::Completed,
        Self::Deleted,
        Self::Waiting,
        Self::Recurring,
    ];

    pub fn as_keyword(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Deleted => "deleted",
            Self::Waiting => "waiting",
            Self::Recurring => "recurring",
        }
    }

    pub fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "deleted" => Some(Self::Deleted),
            "waiting" => Some(Self::Waiting),
            "recurring" => Some(Self::Recurring),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Deleted)
    }

    pub fn is_active(&self) -> bool {
        !self.is_done()
    }

    /// Only pending and waiting tasks carry a short numeric id.
    pub fn has_id(&self) -> bool {
        matches!(self, Self::Pending | Self::Waiting)
    }
}

/// One task: a flat map of attribute name to string value.
///
/// Dates are stored as epoch seconds, matching the on-disk representation.
/// The numeric `id` is derived from the pending file ordering on every load
/// and is never written out. Neither are the dependency flags, which are
/// worked out when a file is loaded and after gc.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    #[serde(skip)]
    pub id: Option<u32>,
    #[serde(skip)]
    pub is_blocked: bool,
    #[serde(skip)]
    pub is_blocking: bool,
    pub data: BTreeMap<String, String>,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Task {}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        let mut task = Self::default();
        task.set("description", description);
        task
    }

    pub fn from_data(data: BTreeMap<String, String>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.data.get(name).map(|s| s.as_str())
    }

    /// Present and non-empty.
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some_and(|v| !v.is_empty())
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.data.insert(name.to_string(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.data.remove(name)
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.get("uuid").and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn description(&self) -> &str {
        self.get("description").unwrap_or("")
    }

    pub fn parent(&self) -> Option<&str> {
        self.get("parent").filter(|p| !p.is_empty())
    }

    /// Uuids listed in the comma separated `depends` attribute.
    pub fn depends(&self) -> Vec<Uuid> {
        self.get("depends")
            .map(|d| d.split(',').filter_map(|u| Uuid::parse_str(u.trim()).ok()).collect())
            .unwrap_or_default()
    }

    /// Missing status means pending; an unknown keyword is treated the same.
    pub fn status(&self) -> Status {
        self.get("status")
            .and_then(Status::from_keyword)
            .unwrap_or(Status::Pending)
    }

    pub fn set_status(&mut self, status: Status) {
        self.set("status", status.as_keyword());
    }

    pub fn get_date(&self, name: &str) -> Option<DateTime<Utc>> {
        let epoch = self.get(name)?.trim().parse::<i64>().ok()?;
        Utc.timestamp_opt(epoch, 0).single()
    }

    pub fn set_date(&mut self, name: &str, when: DateTime<Utc>) {
        self.set(name, when.timestamp().to_string());
    }

    pub fn set_as_now(&mut self, name: &str) {
        self.set_date(name, Utc::now());
    }

    pub fn tags(&self) -> Vec<&str> {
        self.get("tags")
            .map(|t| t.split(',').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags().contains(&tag)
    }

    pub fn add_tag(&mut self, tag: &str) {
        if self.has_tag(tag) {
            return;
        }
        let mut tags: Vec<String> = self.tags().into_iter().map(String::from).collect();
        tags.push(tag.to_string());
        self.set("tags", tags.join(","));
    }

    pub fn remove_tag(&mut self, tag: &str) {
        let tags: Vec<&str> = self.tags().into_iter().filter(|t| *t != tag).collect();
        if tags.is_empty() {
            self.remove("tags");
        } else {
            let joined = tags.join(",");
            self.set("tags", joined);
        }
    }

    /// Annotations in chronological order, keyed by their epoch timestamp.
    pub fn annotations(&self) -> Vec<(i64, &str)> {
        let mut out: Vec<(i64, &str)> = self
            .data
            .iter()
            .filter_map(|(k, v)| {
                let epoch = k.strip_prefix("annotation_")?.parse::<i64>().ok()?;
                Some((epoch, v.as_str()))
            })
            .collect();
        out.sort_by_key(|(epoch, _)| *epoch);
        out
    }

    pub fn add_annotation(&mut self, text: impl Into<String>) {
        // Two annotations in the same second would collide, so bump the key.
        let mut epoch = Utc::now().timestamp();
        while self.data.contains_key(&format!("annotation_{epoch}")) {
            epoch += 1;
        }
        self.set(&format!("annotation_{epoch}"), text);
    }

    /// Ensure the task is consistent, filling in defaults where possible.
    ///
    /// Assigns a UUID when missing, derives the status from `wait`/`recur`,
    /// and keeps the `entry`, `modified` and `end` timestamps coherent with
    /// the status.
    pub fn validate(&mut self, apply_defaults: bool) -> Result<()> {
        match self.get("uuid").filter(|u| !u.is_empty()) {
            Some(uuid) => {
                if Uuid::parse_str(uuid).is_err() {
                    return Err(Error::InvalidAttribute {
                        name: "uuid".into(),
                        value: uuid.to_string(),
                    });
                }
            }
            None => self.set("uuid", Uuid::new_v4().to_string()),
        }

        let mut status = match self.get("status").filter(|s| !s.is_empty()) {
            Some(keyword) => Status::from_keyword(keyword).ok_or_else(|| Error::InvalidAttribute {
                name: "status".into(),
                value: keyword.to_string(),
            })?,
            None => Status::Pending,
        };

        if status == Status::Pending && self.has("due") && self.has("recur") && self.parent().is_none() {
            status = Status::Recurring;
        } else if status == Status::Pending && self.has("wait") {
            status = Status::Waiting;
        }

        if status == Status::Recurring && !self.has("rtype") {
            self.set("rtype", "periodic");
        }
        self.set_status(status);

        if apply_defaults && !self.has("entry") {
            self.set_as_now("entry");
        }
        if status.is_done() && !self.has("end") {
            self.set_as_now("end");
        }
        if status == Status::Pending && self.has("end") {
            self.remove("end");
        }
        if !self.has("modified") {
            self.set_as_now("modified");
        }

        Ok(())
    }

    /// Human handle: the numeric id when there is one, else the uuid.
    pub fn identifier(&self) -> String {
        match self.id {
            Some(id) => id.to_string(),
            None => self.get("uuid").unwrap_or("").to_string(),
        }
    }
}
