use std::fs;
use std::time::Duration;

use tally::core::task::{Status, Task};
use tally::error::Error;
use tally::store::{Database, DatabaseOptions, GcPolicy, TaskRef, UndoOutcome};
use tempfile::TempDir;

fn open(dir: &TempDir) -> Database {
    Database::open(DatabaseOptions::new(dir.path())).unwrap()
}

#[test]
fn buy_milk() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir);

    let milk = db.add(Task::new("buy milk")).unwrap();
    db.commit().unwrap();
    let uuid = milk.uuid().unwrap();
    assert_eq!(db.id(&uuid).unwrap(), Some(1));
    assert_eq!(db.get(&TaskRef::Id(1)).unwrap(), Some(milk.clone()));

    let mut done = milk.clone();
    done.set_status(Status::Completed);
    db.modify(&milk, done).unwrap();
    db.commit().unwrap();
    assert!(db.gc().unwrap().is_empty());

    assert!(db.pending_tasks().unwrap().is_empty());
    assert_eq!(db.id(&uuid).unwrap(), None);
    let stored = db.get_by_uuid(&uuid).unwrap().unwrap();
    assert_eq!(stored.status(), Status::Completed);
    assert!(stored.has("end"));

    match db.undo().unwrap() {
        UndoOutcome::Reverted(entry) => {
            assert_eq!(entry.before.as_ref(), Some(&milk));
            assert_eq!(entry.sequence, 2);
        }
        UndoOutcome::Empty => panic!("expected the completion to be reverted"),
    }

    let mut fresh = open(&dir);
    assert_eq!(fresh.get_by_uuid(&uuid).unwrap(), Some(milk));
    assert_eq!(fresh.id(&uuid).unwrap(), Some(1));
    assert!(fresh.completed_tasks().unwrap().is_empty());
}

#[test]
fn ids_are_deterministic_across_loads() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir);
    let mut waiting = Task::new("later");
    waiting.set("wait", "4102444800");
    db.add(Task::new("first")).unwrap();
    db.add(waiting).unwrap();
    db.add(Task::new("third")).unwrap();
    db.commit().unwrap();

    let mut a = open(&dir);
    let mut b = open(&dir);
    for id in 1..=3 {
        let left = a.uuid(id).unwrap();
        assert!(left.is_some());
        assert_eq!(left, b.uuid(id).unwrap());
    }
    assert_eq!(a.uuid(4).unwrap(), None);
}

#[test]
fn committed_tasks_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir);
    let mut task = Task::new("quote \"this\" [and] that\nnext line");
    task.set("project", "home:garden");
    task.add_tag("outside");
    task.add_annotation("check the hose");
    let stored = db.add(task).unwrap();
    db.commit().unwrap();

    let mut fresh = open(&dir);
    let loaded = fresh.get_by_uuid(&stored.uuid().unwrap()).unwrap().unwrap();
    assert_eq!(loaded, stored);
    assert_eq!(loaded.description(), "quote \"this\" [and] that\nnext line");
}

#[test]
fn undo_restores_before_image_after_many_edits() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir);
    let original = db.add(Task::new("draft")).unwrap();
    db.commit().unwrap();

    let mut edited = original.clone();
    edited.set("description", "final");
    edited.set("priority", "H");
    db.modify(&original, edited).unwrap();
    db.commit().unwrap();

    db.undo().unwrap();
    let restored = open(&dir).get_by_uuid(&original.uuid().unwrap()).unwrap();
    assert_eq!(restored, Some(original));
}

#[test]
fn undo_of_creation_removes_task_and_backlog_line() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir);
    let task = db.add(Task::new("mistake")).unwrap();
    db.commit().unwrap();
    assert_eq!(db.backlog().unwrap().len(), 1);

    match db.undo().unwrap() {
        UndoOutcome::Reverted(entry) => assert!(entry.is_creation()),
        UndoOutcome::Empty => panic!("expected the creation to be reverted"),
    }

    let mut fresh = open(&dir);
    assert_eq!(fresh.get_by_uuid(&task.uuid().unwrap()).unwrap(), None);
    assert!(fresh.backlog().unwrap().is_empty());
    assert!(fresh.journal().is_empty().unwrap());
}

#[test]
fn empty_undo_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir);
    assert_eq!(db.undo().unwrap(), UndoOutcome::Empty);
    assert!(!db.is_locked());
    for name in ["pending.data", "completed.data", "undo.data", "backlog.data"] {
        assert!(!dir.path().join(name).exists(), "{name} was created");
    }
}

#[test]
fn gc_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mut options = DatabaseOptions::new(dir.path());
    options.gc = false;
    let mut db = Database::open(options).unwrap();

    let keep = db.add(Task::new("keep")).unwrap();
    let finish = db.add(Task::new("finish")).unwrap();
    let mut finished = finish.clone();
    finished.set_status(Status::Completed);
    db.modify(&finish, finished).unwrap();
    db.commit().unwrap();

    // With gc off, the completed task stays where it was written.
    assert_eq!(open(&dir).pending_tasks().unwrap().len(), 2);

    let first = db.gc().unwrap();
    assert_eq!(first.archived, 1);
    db.commit().unwrap();
    let after_first = (db.pending_tasks().unwrap(), db.completed_tasks().unwrap());

    let second = db.gc().unwrap();
    assert!(second.is_empty());
    assert_eq!((db.pending_tasks().unwrap(), db.completed_tasks().unwrap()), after_first);
    assert_eq!(db.id(&keep.uuid().unwrap()).unwrap(), Some(1));
}

#[test]
fn duplicate_uuid_is_rejected_everywhere() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir);
    let mut done = Task::new("done");
    done.set_status(Status::Completed);
    let done = db.add(done).unwrap();
    db.commit().unwrap();

    let mut clash = Task::new("clash");
    clash.set("uuid", done.get("uuid").unwrap());
    let err = db.add(clash).unwrap_err();
    assert!(matches!(err, Error::DuplicateIdentity { uuid } if Some(uuid) == done.uuid()));
    db.unlock();

    let mut fresh = open(&dir);
    assert_eq!(fresh.all_tasks().unwrap().len(), 1);
}

#[test]
fn second_writer_times_out() {
    let dir = TempDir::new().unwrap();
    let mut writer = open(&dir);
    writer.add(Task::new("holding the lock")).unwrap();

    let mut options = DatabaseOptions::new(dir.path());
    options.lock_timeout = Duration::from_millis(150);
    let mut other = Database::open(options).unwrap();
    let err = other.add(Task::new("blocked")).unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
    assert!(!err.is_recoverable());

    writer.commit().unwrap();
    other.add(Task::new("now free")).unwrap();
    other.commit().unwrap();
    assert_eq!(open(&dir).pending_tasks().unwrap().len(), 2);
}

#[test]
fn filter_sees_both_stores() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir);
    let mut errand = Task::new("post letter");
    errand.add_tag("errand");
    db.add(errand).unwrap();
    let mut done = Task::new("buy stamps");
    done.add_tag("errand");
    done.set_status(Status::Completed);
    db.add(done).unwrap();
    db.add(Task::new("read")).unwrap();
    db.commit().unwrap();

    let errands = db.filter(|t| t.has_tag("errand")).unwrap();
    assert_eq!(errands.len(), 2);
    assert_eq!(errands[0].description(), "post letter");
    assert_eq!(errands[1].status(), Status::Completed);
}

#[test]
fn partial_uuid_lookup() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir);
    let task = db.add(Task::new("find me")).unwrap();
    db.commit().unwrap();

    let uuid = task.get("uuid").unwrap().to_string();
    let reference: TaskRef = uuid[..13].parse().unwrap();
    assert!(matches!(reference, TaskRef::Prefix(_)));
    assert_eq!(db.get(&reference).unwrap(), Some(task));
    assert_eq!(db.get(&TaskRef::Id(99)).unwrap(), None);
}

#[test]
fn drop_deleted_policy_on_commit() {
    let dir = TempDir::new().unwrap();
    let mut options = DatabaseOptions::new(dir.path());
    options.gc_policy = GcPolicy::DropDeleted;
    let mut db = Database::open(options).unwrap();
    let task = db.add(Task::new("never mind")).unwrap();
    db.commit().unwrap();

    let mut deleted = task.clone();
    deleted.set_status(Status::Deleted);
    db.modify(&task, deleted).unwrap();
    db.commit().unwrap();

    let mut fresh = open(&dir);
    assert!(fresh.all_tasks().unwrap().is_empty());
    assert_eq!(fresh.journal().len().unwrap(), 2);
}

#[test]
fn corrupt_pending_file_is_reported() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("pending.data"), "[description:\"no uuid\"]\n").unwrap();
    let mut db = open(&dir);
    let err = db.pending_tasks().unwrap_err();
    assert!(matches!(err, Error::Parse { line: 1, .. }));
    assert!(!err.is_recoverable());
}

#[test]
fn refused_commit_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir);
    let task = db.add(Task::new("file taxes")).unwrap();
    db.commit().unwrap();
    let mut done = task.clone();
    done.set_status(Status::Completed);
    db.modify(&task, done).unwrap();
    db.commit().unwrap();

    let completed = dir.path().join("completed.data");
    let mut perms = fs::metadata(&completed).unwrap().permissions();
    perms.set_readonly(true);
    fs::set_permissions(&completed, perms).unwrap();

    let names = ["pending.data", "completed.data", "undo.data", "backlog.data"];
    let snapshot = |dir: &TempDir| -> Vec<String> {
        names
            .iter()
            .map(|name| fs::read_to_string(dir.path().join(name)).unwrap_or_default())
            .collect()
    };
    let before = snapshot(&dir);

    let mut other = open(&dir);
    assert!(other.read_only());
    assert!(matches!(other.undo(), Err(Error::ReadOnly(path)) if path == completed));
    drop(other);
    assert_eq!(snapshot(&dir), before);

    let mut fresh = open(&dir);
    assert_eq!(fresh.all_tasks().unwrap().len(), 1);
    assert_eq!(fresh.journal().len().unwrap(), 2);
}

#[test]
fn undo_of_an_edit_keeps_ids() {
    let dir = TempDir::new().unwrap();
    let mut db = open(&dir);
    let a = db.add(Task::new("a")).unwrap();
    let b = db.add(Task::new("b")).unwrap();
    let c = db.add(Task::new("c")).unwrap();
    db.commit().unwrap();

    let mut edited = a.clone();
    edited.set("description", "a, reworded");
    db.modify(&a, edited).unwrap();
    db.commit().unwrap();
    db.undo().unwrap();

    let mut fresh = open(&dir);
    assert_eq!(fresh.id(&a.uuid().unwrap()).unwrap(), Some(1));
    assert_eq!(fresh.id(&b.uuid().unwrap()).unwrap(), Some(2));
    assert_eq!(fresh.id(&c.uuid().unwrap()).unwrap(), Some(3));
    assert_eq!(fresh.get_by_id(1).unwrap(), Some(a));
}
