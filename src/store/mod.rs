pub mod database;
pub mod file;
pub mod format;
pub mod ids;
pub mod lock;
pub mod undo;

pub use database::{Database, DatabaseOptions, GcPolicy, GcReport, TaskRef, UndoOutcome};
pub use file::{Category, FileStats, TaskFile};
pub use undo::{UndoEntry, UndoJournal};
