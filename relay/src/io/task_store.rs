//! Task store boundary and the file-backed implementation.
//!
//! The engine talks to tasks only through [`TaskStore`]; tests and other
//! backends plug in their own. [`FileTaskStore`] keeps one JSON file per task
//! under `<cache>/tasks/` and serializes writes with the global lock.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, instrument, warn};

use crate::core::fingerprint::description_marker;
use crate::core::task::{NewTask, TaskFilter, TaskMetadata, TaskRecord, TaskStatus, TaskUpdate};
use crate::io::atomic::{read_json, write_json_atomic};
use crate::io::lock::LockDir;
use crate::io::paths::CachePaths;

/// Operations the engine needs from a task datastore.
///
/// `Ok(None)` / `Ok(false)` are soft failures (task missing, update refused);
/// callers report them as data instead of aborting.
pub trait TaskStore: Send + Sync {
    fn show(&self, id: &str) -> Result<Option<TaskRecord>>;

    fn update(&self, id: &str, update: &TaskUpdate) -> Result<bool>;

    /// Apply `edit` to the stored metadata as one read-modify-write.
    ///
    /// Fields `edit` leaves alone keep whatever was stored at write time, so
    /// concurrent edits of different fields never undo each other.
    fn update_metadata(&self, id: &str, edit: &mut dyn FnMut(&mut TaskMetadata)) -> Result<bool>;

    fn create(&self, task: &NewTask) -> Result<String>;

    fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>>;

    /// Record that `blocked_id` cannot proceed until `blocker_id` closes.
    fn add_dependency(&self, blocked_id: &str, blocker_id: &str) -> Result<bool>;

    /// Return the open fix task for `fingerprint`, creating it from `task` if none exists.
    ///
    /// The boolean is `true` when a new task was created. Stores that can make
    /// lookup-then-create atomic should override this.
    fn find_or_create_fix(&self, fingerprint: &str, task: &NewTask) -> Result<(String, bool)> {
        if let Some(existing) = find_open_fix(&self.list(&TaskFilter::open_fix_tasks())?, fingerprint) {
            return Ok((existing, false));
        }
        Ok((self.create(task)?, true))
    }
}

/// Id of the first open fix task carrying `fingerprint`, by metadata or description marker.
pub fn find_open_fix(tasks: &[TaskRecord], fingerprint: &str) -> Option<String> {
    let marker = description_marker(fingerprint);
    tasks
        .iter()
        .filter(|t| t.status.is_open() && t.metadata.is_fix_task())
        .find(|t| {
            t.metadata.fingerprint.as_deref() == Some(fingerprint) || t.description.contains(&marker)
        })
        .map(|t| t.id.clone())
}

/// One JSON file per task.
#[derive(Debug, Clone)]
pub struct FileTaskStore {
    paths: CachePaths,
    lock: LockDir,
    lock_timeout: Duration,
}

impl FileTaskStore {
    pub fn new(paths: CachePaths, lock: LockDir, lock_timeout: Duration) -> Self {
        Self {
            paths,
            lock,
            lock_timeout,
        }
    }

    /// Insert or replace a full record.
    pub fn put(&self, task: &TaskRecord) -> Result<()> {
        self.lock.with_lock("tasks:put", self.lock_timeout, || {
            write_json_atomic(&self.paths.task_path(&task.id), task)
        })
    }

    fn read(&self, id: &str) -> Result<Option<TaskRecord>> {
        let path = self.paths.task_path(id);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    fn read_all(&self) -> Result<Vec<TaskRecord>> {
        let dir = &self.paths.tasks_dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("read tasks dir {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        let mut tasks = Vec::with_capacity(paths.len());
        for path in paths {
            match read_json::<TaskRecord>(&path) {
                Ok(task) => tasks.push(task),
                Err(err) => warn!(err = %err, path = %path.display(), "skipping unreadable task"),
            }
        }
        Ok(tasks)
    }

    fn insert_new(&self, task: &NewTask) -> Result<String> {
        let id = loop {
            let candidate = generate_task_id();
            if !self.paths.task_path(&candidate).exists() {
                break candidate;
            }
        };
        let record = TaskRecord {
            id: id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            status: TaskStatus::Open,
            notes: None,
            blocked_by: Vec::new(),
            metadata: task.metadata.clone(),
        };
        write_json_atomic(&self.paths.task_path(&id), &record)?;
        debug!(task_id = %id, "task created");
        Ok(id)
    }
}

impl TaskStore for FileTaskStore {
    fn show(&self, id: &str) -> Result<Option<TaskRecord>> {
        self.read(id)
    }

    #[instrument(skip_all, fields(task_id = %id))]
    fn update(&self, id: &str, update: &TaskUpdate) -> Result<bool> {
        self.lock.with_lock("tasks:update", self.lock_timeout, || {
            let Some(mut task) = self.read(id)? else {
                return Ok(false);
            };
            if let Some(status) = update.status {
                task.status = status;
            }
            if let Some(notes) = update.notes.as_ref() {
                task.notes = Some(notes.clone());
            }
            write_json_atomic(&self.paths.task_path(id), &task)?;
            Ok(true)
        })
    }

    #[instrument(skip_all, fields(task_id = %id))]
    fn update_metadata(&self, id: &str, edit: &mut dyn FnMut(&mut TaskMetadata)) -> Result<bool> {
        self.lock.with_lock("tasks:update_metadata", self.lock_timeout, || {
            let Some(mut task) = self.read(id)? else {
                return Ok(false);
            };
            edit(&mut task.metadata);
            write_json_atomic(&self.paths.task_path(id), &task)?;
            Ok(true)
        })
    }

    fn create(&self, task: &NewTask) -> Result<String> {
        self.lock
            .with_lock("tasks:create", self.lock_timeout, || self.insert_new(task))
    }

    fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect())
    }

    #[instrument(skip_all, fields(blocked = %blocked_id, blocker = %blocker_id))]
    fn add_dependency(&self, blocked_id: &str, blocker_id: &str) -> Result<bool> {
        self.lock.with_lock("tasks:add_dependency", self.lock_timeout, || {
            if self.read(blocker_id)?.is_none() {
                return Ok(false);
            }
            let Some(mut task) = self.read(blocked_id)? else {
                return Ok(false);
            };
            if !task.blocked_by.iter().any(|b| b == blocker_id) {
                task.blocked_by.push(blocker_id.to_string());
                write_json_atomic(&self.paths.task_path(blocked_id), &task)?;
            }
            Ok(true)
        })
    }

    /// Lookup and create happen under one lock hold, so concurrent failures
    /// with the same fingerprint converge on a single fix task.
    fn find_or_create_fix(&self, fingerprint: &str, task: &NewTask) -> Result<(String, bool)> {
        self.lock.with_lock("tasks:find_or_create_fix", self.lock_timeout, || {
            let open = self
                .read_all()?
                .into_iter()
                .filter(|t| TaskFilter::open_fix_tasks().matches(t))
                .collect::<Vec<_>>();
            if let Some(existing) = find_open_fix(&open, fingerprint) {
                return Ok((existing, false));
            }
            Ok((self.insert_new(task)?, true))
        })
    }
}

fn generate_task_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("relay-{suffix}")
}
