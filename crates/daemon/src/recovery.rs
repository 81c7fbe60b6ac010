//! Crash recovery for the task queue.
//!
//! On startup every batch's `tasks/` directory is scanned. A task left
//! `running` means the previous process died mid-execution; a task left
//! `queued` was never admitted. Both are reset to `queued` and handed back to
//! the pool, oldest first.

use crate::atomic::is_temp_file;
use crate::records::{Task, TaskRef, TaskStatus};
use crate::store::{RecordStore, StoreError};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Depth of `<root>/<batch>/tasks/<task>.json` relative to the root.
const TASK_FILE_DEPTH: usize = 3;

/// Extracts `(batch_id, task_id)` from a task file path under the root.
fn task_ids_from_path(path: &Path) -> Option<(String, String)> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") || is_temp_file(path) {
        return None;
    }
    let tasks_dir = path.parent()?;
    if tasks_dir.file_name()?.to_str()? != "tasks" {
        return None;
    }
    let batch_id = tasks_dir.parent()?.file_name()?.to_str()?.to_string();
    let task_id = path.file_stem()?.to_str()?.to_string();
    Some((batch_id, task_id))
}

/// Every readable task record that still needs the pool, oldest first.
pub fn find_unfinished_tasks(store: &RecordStore) -> Vec<Task> {
    if !store.root().exists() {
        return Vec::new();
    }

    let walker = WalkDir::new(store.root())
        .min_depth(TASK_FILE_DEPTH)
        .max_depth(TASK_FILE_DEPTH)
        .sort_by_file_name();

    let mut tasks = Vec::new();
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some((batch_id, task_id)) = task_ids_from_path(entry.path()) else {
            continue;
        };

        match store.read_task(&batch_id, &task_id) {
            Ok(task) if task.status.is_active() => tasks.push(task),
            Ok(_) => {}
            Err(e) => {
                warn!(batch_id = %batch_id, task_id = %task_id, error = %e, "Skipping unreadable task during recovery");
            }
        }
    }

    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    tasks
}

/// Resets unfinished tasks to `queued` and passes each to `enqueue`.
///
/// Returns how many references `enqueue` accepted.
pub fn recover_tasks<F>(store: &RecordStore, enqueue: F) -> Result<usize, StoreError>
where
    F: FnMut(TaskRef) -> bool,
{
    recover_tasks_except(store, &HashSet::new(), enqueue)
}

/// Like [`recover_tasks`], leaving alone any task id in `skip` (tasks this
/// process is already tracking).
pub fn recover_tasks_except<F>(
    store: &RecordStore,
    skip: &HashSet<String>,
    mut enqueue: F,
) -> Result<usize, StoreError>
where
    F: FnMut(TaskRef) -> bool,
{
    let mut accepted = 0;
    for mut task in find_unfinished_tasks(store) {
        if skip.contains(&task.id) {
            continue;
        }

        if task.status == TaskStatus::Running {
            info!(batch_id = %task.batch_id, task_id = %task.id, "Resetting interrupted task to queued");
        }
        task.status = TaskStatus::Queued;
        store.write_task(&mut task)?;

        if enqueue(task.task_ref()) {
            accepted += 1;
        }
    }

    if accepted > 0 {
        info!(count = accepted, "Recovered unfinished tasks");
    }
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::TaskKind;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn set_status(store: &RecordStore, task: &mut Task, status: TaskStatus) {
        task.status = status;
        store.write_task(task).unwrap();
    }

    #[test]
    fn test_task_ids_from_path() {
        let path = PathBuf::from("/root/b1/tasks/t1.json");
        assert_eq!(
            task_ids_from_path(&path),
            Some(("b1".to_string(), "t1".to_string()))
        );
        assert_eq!(task_ids_from_path(Path::new("/root/b1/results/t1.json")), None);
        assert_eq!(task_ids_from_path(Path::new("/root/b1/tasks/t1.txt")), None);
        assert_eq!(
            task_ids_from_path(Path::new("/root/b1/tasks/.t1.json.abc.tmp")),
            None
        );
    }

    #[test]
    fn test_missing_root_recovers_nothing() {
        let store = RecordStore::new("/nonexistent/reelq/recovery");
        let count = recover_tasks(&store, |_| true).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_recover_resets_running_and_queued_only() {
        let temp_dir = TempDir::new().unwrap();
        let store = RecordStore::new(temp_dir.path());
        let batch = store.create_batch("r").unwrap();

        let mut running = store.create_task(&batch.id, TaskKind::Url, "u1").unwrap();
        set_status(&store, &mut running, TaskStatus::Running);
        let queued = store.create_task(&batch.id, TaskKind::Url, "u2").unwrap();
        let mut done = store.create_task(&batch.id, TaskKind::Url, "u3").unwrap();
        set_status(&store, &mut done, TaskStatus::Success);
        let mut failed = store.create_task(&batch.id, TaskKind::Url, "u4").unwrap();
        set_status(&store, &mut failed, TaskStatus::Failed);

        let mut seen = Vec::new();
        let count = recover_tasks(&store, |r| {
            seen.push(r.task_id);
            true
        })
        .unwrap();

        assert_eq!(count, 2);
        seen.sort();
        let mut expected = vec![running.id.clone(), queued.id.clone()];
        expected.sort();
        assert_eq!(seen, expected);

        assert_eq!(
            store.read_task(&batch.id, &running.id).unwrap().status,
            TaskStatus::Queued
        );
        assert_eq!(
            store.read_task(&batch.id, &done.id).unwrap().status,
            TaskStatus::Success
        );
    }

    #[test]
    fn test_recover_orders_oldest_first_across_batches() {
        let temp_dir = TempDir::new().unwrap();
        let store = RecordStore::new(temp_dir.path());
        let a = store.create_batch("a").unwrap();
        let b = store.create_batch("b").unwrap();

        let mut first = store.create_task(&b.id, TaskKind::Url, "first").unwrap();
        first.created_at = 1;
        store.write_task(&mut first).unwrap();
        let mut second = store.create_task(&a.id, TaskKind::Url, "second").unwrap();
        second.created_at = 2;
        store.write_task(&mut second).unwrap();

        let order: Vec<String> = find_unfinished_tasks(&store)
            .into_iter()
            .map(|t| t.payload)
            .collect();
        assert_eq!(order, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_recover_skips_corrupt_records_and_known_ids() {
        let temp_dir = TempDir::new().unwrap();
        let store = RecordStore::new(temp_dir.path());
        let batch = store.create_batch("r").unwrap();
        let tracked = store.create_task(&batch.id, TaskKind::Url, "u1").unwrap();
        let untracked = store.create_task(&batch.id, TaskKind::Url, "u2").unwrap();
        fs::write(
            temp_dir.path().join(&batch.id).join("tasks").join("zz-broken.json"),
            "{",
        )
        .unwrap();

        let skip: HashSet<String> = [tracked.id.clone()].into_iter().collect();
        let mut seen = Vec::new();
        let count = recover_tasks_except(&store, &skip, |r| {
            seen.push(r.task_id);
            true
        })
        .unwrap();

        assert_eq!(count, 1);
        assert_eq!(seen, vec![untracked.id]);
    }

    #[test]
    fn test_rejected_enqueue_is_not_counted() {
        let temp_dir = TempDir::new().unwrap();
        let store = RecordStore::new(temp_dir.path());
        let batch = store.create_batch("r").unwrap();
        store.create_task(&batch.id, TaskKind::Url, "u1").unwrap();

        let count = recover_tasks(&store, |_| false).unwrap();
        assert_eq!(count, 0);
    }
}
