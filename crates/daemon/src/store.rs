//! Durable record store.
//!
//! Batches, tasks and results are persisted as individual JSON files under a
//! data root:
//!
//! ```text
//! <root>/<batch_id>/batch.json
//! <root>/<batch_id>/tasks/<task_id>.json
//! <root>/<batch_id>/uploads/<file>
//! <root>/<batch_id>/results/<task_id>.result.json
//! ```
//!
//! Every write goes through [`crate::atomic::atomic_write`]. Bulk reads fail
//! soft: a missing directory is an empty listing and a corrupt record is
//! skipped with a warning.

use crate::atomic::{atomic_write, atomic_write_json, is_temp_file};
use crate::records::{
    current_timestamp_ms, Batch, BatchCounts, BatchStatus, Counter, ResultRecord, Task, TaskKind,
    TaskStatus,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const BATCH_FILE: &str = "batch.json";
const TASKS_DIR: &str = "tasks";
const UPLOADS_DIR: &str = "uploads";
const RESULTS_DIR: &str = "results";
const RESULT_SUFFIX: &str = ".result.json";

/// Default page size for [`RecordStore::list_tasks`].
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Errors returned by the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record does not exist or could not be parsed.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// An id or file name that cannot be used as a path component.
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    /// Filesystem failure while reading or writing a record.
    #[error("Store IO error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Filter and pagination for task listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub status: Option<TaskStatus>,
    pub limit: usize,
    /// File name of the last task seen on the previous page.
    pub cursor: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            status: None,
            limit: DEFAULT_PAGE_LIMIT,
            cursor: None,
        }
    }
}

/// One page of tasks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    /// Present when more task files follow this page.
    pub next_cursor: Option<String>,
}

/// Returns true if `name` is safe to join onto a directory path.
fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
}

fn check_component(name: &str) -> Result<(), StoreError> {
    if is_safe_component(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// File-per-record store rooted at a data directory.
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn batch_dir(&self, batch_id: &str) -> Result<PathBuf, StoreError> {
        check_component(batch_id)?;
        Ok(self.root.join(batch_id))
    }

    fn tasks_dir(&self, batch_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.batch_dir(batch_id)?.join(TASKS_DIR))
    }

    fn task_file(&self, batch_id: &str, task_id: &str) -> Result<PathBuf, StoreError> {
        check_component(task_id)?;
        Ok(self.tasks_dir(batch_id)?.join(format!("{}.json", task_id)))
    }

    /// Path where the result for `task_id` is (or would be) stored.
    pub fn result_file(&self, batch_id: &str, task_id: &str) -> Result<PathBuf, StoreError> {
        check_component(task_id)?;
        Ok(self
            .batch_dir(batch_id)?
            .join(RESULTS_DIR)
            .join(format!("{}{}", task_id, RESULT_SUFFIX)))
    }

    /// Resolves a `file` task payload to its location under `uploads/`.
    pub fn upload_path(&self, batch_id: &str, name: &str) -> Result<PathBuf, StoreError> {
        check_component(name)?;
        Ok(self.batch_dir(batch_id)?.join(UPLOADS_DIR).join(name))
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    /// Creates a batch with a fresh id and zeroed counts.
    pub fn create_batch(&self, title: &str) -> Result<Batch, StoreError> {
        let batch = Batch {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: current_timestamp_ms(),
            status: BatchStatus::Active,
            counts: BatchCounts::default(),
        };

        let dir = self.batch_dir(&batch.id)?;
        for sub in [TASKS_DIR, UPLOADS_DIR, RESULTS_DIR] {
            fs::create_dir_all(dir.join(sub))?;
        }
        self.write_batch(&batch)?;
        debug!(batch_id = %batch.id, "Created batch");
        Ok(batch)
    }

    pub fn read_batch(&self, batch_id: &str) -> Result<Batch, StoreError> {
        let path = self.batch_dir(batch_id)?.join(BATCH_FILE);
        read_record(&path, "batch", batch_id)
    }

    pub fn write_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        let path = self.batch_dir(&batch.id)?.join(BATCH_FILE);
        atomic_write_json(&path, batch)?;
        Ok(())
    }

    /// All readable batches, oldest first.
    pub fn list_batches(&self) -> Result<Vec<Batch>, StoreError> {
        let mut batches = Vec::new();
        for batch_id in self.batch_ids()? {
            match self.read_batch(&batch_id) {
                Ok(batch) => batches.push(batch),
                Err(e) => warn!(batch_id = %batch_id, error = %e, "Skipping unreadable batch"),
            }
        }
        batches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(batches)
    }

    /// Directory names under the root, sorted. A missing root yields nothing.
    pub fn batch_ids(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|name| is_safe_component(name))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Read-modify-write of one advisory tally.
    ///
    /// Not atomic with respect to other writers of the same batch; concurrent
    /// bumps may lose an increment.
    pub fn bump_batch_counter(&self, batch_id: &str, counter: Counter) -> Result<Batch, StoreError> {
        let mut batch = self.read_batch(batch_id)?;
        batch.counts.bump(counter);
        self.write_batch(&batch)?;
        Ok(batch)
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Creates a queued task in an existing batch.
    pub fn create_task(
        &self,
        batch_id: &str,
        kind: TaskKind,
        payload: &str,
    ) -> Result<Task, StoreError> {
        // The batch must exist
        self.read_batch(batch_id)?;

        let now = current_timestamp_ms();
        let mut task = Task {
            id: Uuid::new_v4().to_string(),
            batch_id: batch_id.to_string(),
            kind,
            payload: payload.to_string(),
            status: TaskStatus::Queued,
            progress: 0,
            stage: None,
            retries: 0,
            error: None,
            result_path: None,
            created_at: now,
            updated_at: now,
        };
        self.write_task(&mut task)?;
        debug!(batch_id = %batch_id, task_id = %task.id, kind = %kind, "Created task");
        Ok(task)
    }

    pub fn read_task(&self, batch_id: &str, task_id: &str) -> Result<Task, StoreError> {
        let path = self.task_file(batch_id, task_id)?;
        read_record(&path, "task", task_id)
    }

    /// Persists the task, refreshing `updated_at` first.
    pub fn write_task(&self, task: &mut Task) -> Result<(), StoreError> {
        task.touch();
        let path = self.task_file(&task.batch_id, &task.id)?;
        atomic_write_json(&path, task)?;
        Ok(())
    }

    /// Finds a task by id alone by scanning every batch.
    pub fn find_task(&self, task_id: &str) -> Result<Task, StoreError> {
        check_component(task_id)?;
        for batch_id in self.batch_ids()? {
            let path = self.task_file(&batch_id, task_id)?;
            if path.is_file() {
                return self.read_task(&batch_id, task_id);
            }
        }
        Err(StoreError::NotFound {
            kind: "task",
            id: task_id.to_string(),
        })
    }

    /// Lists tasks in file-name order, optionally filtered by status.
    ///
    /// Unreadable or half-written records are skipped, so one bad file never
    /// fails the whole listing.
    pub fn list_tasks(&self, batch_id: &str, query: &ListQuery) -> Result<TaskPage, StoreError> {
        let dir = self.tasks_dir(batch_id)?;
        let names = list_json_names(&dir)?;
        let limit = query.limit.max(1);

        let start = match &query.cursor {
            Some(cursor) => names.partition_point(|name| name.as_str() <= cursor.as_str()),
            None => 0,
        };

        let mut tasks = Vec::new();
        let mut next_cursor = None;
        for (idx, name) in names.iter().enumerate().skip(start) {
            let task: Task = match read_json(&dir.join(name)) {
                Ok(task) => task,
                Err(e) => {
                    warn!(batch_id = %batch_id, file = %name, error = %e, "Skipping unreadable task record");
                    continue;
                }
            };

            if query.status.map_or(true, |s| s == task.status) {
                tasks.push(task);
            }

            if tasks.len() >= limit {
                if idx + 1 < names.len() {
                    next_cursor = Some(name.clone());
                }
                break;
            }
        }

        Ok(TaskPage { tasks, next_cursor })
    }

    /// Every readable task in the batch, in file-name order.
    pub fn all_tasks(&self, batch_id: &str) -> Result<Vec<Task>, StoreError> {
        let mut out = Vec::new();
        let mut query = ListQuery {
            limit: 500,
            ..ListQuery::default()
        };
        loop {
            let page = self.list_tasks(batch_id, &query)?;
            out.extend(page.tasks);
            match page.next_cursor {
                Some(cursor) => query.cursor = Some(cursor),
                None => return Ok(out),
            }
        }
    }

    /// Removes a task and its result. Missing files are not an error.
    pub fn delete_task(&self, batch_id: &str, task_id: &str) -> Result<(), StoreError> {
        remove_if_exists(&self.task_file(batch_id, task_id)?)?;
        remove_if_exists(&self.result_file(batch_id, task_id)?)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Results and uploads
    // ------------------------------------------------------------------

    /// Writes (or replaces) the result for a task and returns its path.
    pub fn write_result(&self, result: &ResultRecord) -> Result<PathBuf, StoreError> {
        let path = self.result_file(&result.batch_id, &result.task_id)?;
        atomic_write_json(&path, result)?;
        Ok(path)
    }

    pub fn read_result(&self, batch_id: &str, task_id: &str) -> Result<ResultRecord, StoreError> {
        let path = self.result_file(batch_id, task_id)?;
        read_record(&path, "result", task_id)
    }

    /// Stores raw input bytes under the batch's `uploads/` directory.
    pub fn save_upload(
        &self,
        batch_id: &str,
        name: &str,
        contents: &[u8],
    ) -> Result<PathBuf, StoreError> {
        self.read_batch(batch_id)?;
        let path = self.upload_path(batch_id, name)?;
        atomic_write(&path, contents)?;
        Ok(path)
    }
}

/// Sorted `*.json` file names in `dir`, excluding temp files.
fn list_json_names(dir: &Path) -> Result<Vec<String>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| !is_temp_file(p))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .collect();
    names.sort();
    Ok(names)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, io::Error> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Single-record read: missing and corrupt records both surface as `NotFound`.
fn read_record<T: DeserializeOwned>(
    path: &Path,
    kind: &'static str,
    id: &str,
) -> Result<T, StoreError> {
    match read_json(path) {
        Ok(record) => Ok(record),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound {
            kind,
            id: id.to_string(),
        }),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            warn!(path = %path.display(), error = %e, "Corrupt {} record", kind);
            Err(StoreError::NotFound {
                kind,
                id: id.to_string(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
