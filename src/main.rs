use tally::config::TallyConfig;
use tally::core::task::{Status, Task};
use tally::store::{Database, TaskRef, UndoOutcome};

const USAGE: &str = "usage: tally [--data DIR] <add|list|info|done|delete|wait|modify|undo|gc|stats> [args]";

fn init_logging(debug: bool) {
    // Log to the systemd user journal (`journalctl --user -t tally -f`).
    // tally itself at info/debug (per config), everything else at warn.
    struct FilteredJournal {
        inner: systemd_journal_logger::JournalLog,
    }

    impl log::Log for FilteredJournal {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            if metadata.target().starts_with("tally") {
                let max = if tally::debug_logging() { log::LevelFilter::Debug } else { log::LevelFilter::Info };
                metadata.level() <= max
            } else {
                metadata.level() <= log::LevelFilter::Warn
            }
        }
        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                self.inner.log(record);
            }
        }
        fn flush(&self) {
            self.inner.flush();
        }
    }

    tally::set_debug_logging(debug);

    // No journal (containers, non-systemd hosts): run without a logger.
    let journal = match systemd_journal_logger::JournalLog::new() {
        Ok(journal) => journal.with_syslog_identifier("tally".to_string()),
        Err(_) => return,
    };
    if log::set_boxed_logger(Box::new(FilteredJournal { inner: journal })).is_ok() {
        // Global max must be Debug so debug logs can pass through when toggled
        log::set_max_level(log::LevelFilter::Debug);
    }
}

fn resolve(db: &mut Database, arg: Option<&String>) -> Result<Task, Box<dyn std::error::Error>> {
    let arg = arg.ok_or(USAGE)?;
    let reference: TaskRef = arg.parse()?;
    db.get(&reference)?
        .ok_or_else(|| tally::Error::NotFound(reference.to_string()).into())
}

fn print_task(task: &Task) {
    println!("{:<12} {}", "ID", task.id.map_or("-".to_string(), |id| id.to_string()));
    for (name, value) in &task.data {
        println!("{:<12} {}", name, value);
    }
}

fn change_status(db: &mut Database, arg: Option<&String>, status: Status) -> Result<(), Box<dyn std::error::Error>> {
    let task = resolve(db, arg)?;
    let mut changed = task.clone();
    changed.set_status(status);
    db.modify(&task, changed)?;
    db.commit()?;
    println!("Task {} '{}' is now {}.", task.identifier(), task.description(), status.as_keyword());
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let mut config = TallyConfig::load();
    if let Some(pos) = args.iter().position(|a| a == "--data") {
        let dir = args.get(pos + 1).cloned().ok_or(USAGE)?;
        config.override_data_location(Some(dir.into()));
        args.drain(pos..=pos + 1);
    }

    init_logging(config.debug_logging);
    config.ensure_dirs()?;

    let Some(command) = args.first().cloned() else {
        eprintln!("{USAGE}");
        return Ok(());
    };
    let rest = &args[1..];

    let mut db = Database::open(config.database_options())?;
    log::debug!("Running '{}' against {}", command, db.location().display());

    match command.as_str() {
        "add" => {
            if rest.is_empty() {
                return Err(USAGE.into());
            }
            let task = db.add(Task::new(rest.join(" ")))?;
            db.commit()?;
            println!("Created task {}.", task.identifier());
        }
        "list" => {
            for task in db.pending_tasks()? {
                if let Some(id) = task.id {
                    println!("{:>4} {:<9} {}", id, task.status().as_keyword(), task.description());
                }
            }
        }
        "info" => print_task(&resolve(&mut db, rest.first())?),
        "done" => change_status(&mut db, rest.first(), Status::Completed)?,
        "delete" => change_status(&mut db, rest.first(), Status::Deleted)?,
        "wait" => {
            let task = resolve(&mut db, rest.first())?;
            let until: i64 = rest.get(1).ok_or(USAGE)?.parse()?;
            let mut changed = task.clone();
            changed.set("wait", until.to_string());
            changed.set_status(Status::Waiting);
            db.modify(&task, changed)?;
            db.commit()?;
            println!("Task {} is waiting.", task.identifier());
        }
        "modify" => {
            let task = resolve(&mut db, rest.first())?;
            let mut changed = task.clone();
            for pair in &rest[1..] {
                let (name, value) = pair.split_once(':').ok_or(USAGE)?;
                if value.is_empty() {
                    changed.remove(name);
                } else {
                    changed.set(name, value);
                }
            }
            db.modify(&task, changed)?;
            db.commit()?;
            println!("Modified task {}.", task.identifier());
        }
        "undo" => match db.undo()? {
            UndoOutcome::Empty => println!("No changes to undo."),
            UndoOutcome::Reverted(entry) => {
                for change in entry.changes() {
                    println!(
                        "{:<12} {} -> {}",
                        change.name,
                        change.before.as_deref().unwrap_or("(none)"),
                        change.after.as_deref().unwrap_or("(none)")
                    );
                }
                println!("Reverted change #{}.", entry.sequence);
            }
        },
        "gc" => {
            let report = db.gc()?;
            db.commit()?;
            println!(
                "{} archived, {} dropped, {} revived, {} woken.",
                report.archived, report.dropped, report.revived, report.woken
            );
        }
        "stats" => {
            println!("Pending     {}", db.pending_tasks()?.len());
            println!("Completed   {}", db.completed_tasks()?.len());
            println!("Undo        {}", db.journal().len()?);
            println!("Backlog     {}", db.backlog()?.len());
            for (category, stats) in db.stats() {
                log::debug!("{:>10} {}", category.label(), stats);
            }
        }
        other => {
            eprintln!("Unknown command '{other}'.\n{USAGE}");
        }
    }

    Ok(())
}
