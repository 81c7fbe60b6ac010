//! The analysis seam.
//!
//! The pool treats analysis as an opaque async call. Implementations receive
//! the task record and a [`TaskContext`] for progress reporting and
//! cooperative cancellation. Because crash recovery may re-run a task whose
//! side effects already happened, implementations must tolerate being invoked
//! more than once for the same task.

use crate::cache::{CacheError, ContentCache};
use crate::records::{Task, TaskKind, TaskRef, TaskStatus};
use crate::store::RecordStore;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure of one analysis run.
#[derive(Debug, Error)]
pub enum AnalyzeError {
    /// The run observed its cancellation flag and stopped.
    #[error("Task was canceled")]
    Canceled,

    /// The source could not be materialized through the content cache.
    #[error("Source fetch failed: {0}")]
    Source(#[from] CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

impl AnalyzeError {
    pub fn failed(msg: impl Into<String>) -> Self {
        AnalyzeError::Failed(msg.into())
    }
}

/// Handle given to an analyzer while a task executes.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_ref: TaskRef,
    store: RecordStore,
    cancel: Arc<AtomicBool>,
}

impl TaskContext {
    pub(crate) fn new(task_ref: TaskRef, store: RecordStore, cancel: Arc<AtomicBool>) -> Self {
        Self {
            task_ref,
            store,
            cancel,
        }
    }

    pub fn task_ref(&self) -> &TaskRef {
        &self.task_ref
    }

    /// Records progress on the task. Fire-and-forget: a failed write is
    /// logged and otherwise ignored, and never aborts the task.
    pub fn report_progress(&self, percent: u8, stage: Option<&str>) {
        let TaskRef { batch_id, task_id } = &self.task_ref;
        let result = self.store.read_task(batch_id, task_id).and_then(|mut task| {
            if task.status != TaskStatus::Running {
                return Ok(());
            }
            task.set_progress(percent);
            task.stage = stage.map(str::to_string);
            self.store.write_task(&mut task)
        });

        match result {
            Ok(()) => debug!(task_id = %task_id, percent, stage = ?stage, "Progress"),
            Err(e) => warn!(task_id = %task_id, error = %e, "Progress write failed"),
        }
    }

    /// True once cancellation was requested for this task.
    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Returns `Err(AnalyzeError::Canceled)` if cancellation was requested.
    ///
    /// Call at safe points between steps; nothing interrupts a step that
    /// never checks.
    pub fn check_canceled(&self) -> Result<(), AnalyzeError> {
        if self.is_canceled() {
            Err(AnalyzeError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Unit of work executed by the pool for every task.
#[async_trait]
pub trait Analyzer: Send + Sync + 'static {
    /// Produce the task's result document.
    async fn analyze(
        &self,
        task: &Task,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, AnalyzeError>;
}

/// Built-in analyzer that materializes the task's source and reports what it
/// found: URL tasks go through the content cache, file tasks are located in
/// the batch's uploads.
pub struct SourceProbeAnalyzer {
    cache: Arc<ContentCache>,
    store: RecordStore,
}

impl SourceProbeAnalyzer {
    pub fn new(cache: Arc<ContentCache>, store: RecordStore) -> Self {
        Self { cache, store }
    }
}

#[async_trait]
impl Analyzer for SourceProbeAnalyzer {
    async fn analyze(
        &self,
        task: &Task,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, AnalyzeError> {
        match task.kind {
            TaskKind::Url => {
                ctx.report_progress(10, Some("fetching"));
                let media = self.cache.get_or_fetch(&task.payload).await?;
                ctx.check_canceled()?;
                ctx.report_progress(90, Some("probing"));

                Ok(json!({
                    "source": task.payload,
                    "token_id": media.token_id,
                    "video_id": media.video_id,
                    "size_bytes": media.size,
                    "cache_hit": media.cache_hit,
                }))
            }
            TaskKind::File => {
                ctx.report_progress(10, Some("locating"));
                let path = self
                    .store
                    .upload_path(&task.batch_id, &task.payload)
                    .map_err(|e| AnalyzeError::failed(e.to_string()))?;
                let metadata = tokio::fs::metadata(&path).await?;
                ctx.check_canceled()?;
                if metadata.len() == 0 {
                    return Err(AnalyzeError::failed(format!(
                        "Upload {} is empty",
                        task.payload
                    )));
                }

                Ok(json!({
                    "source": task.payload,
                    "size_bytes": metadata.len(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn running_task(store: &RecordStore) -> Task {
        let batch = store.create_batch("ctx").unwrap();
        let mut task = store
            .create_task(&batch.id, TaskKind::Url, "https://example.com/v")
            .unwrap();
        task.status = TaskStatus::Running;
        store.write_task(&mut task).unwrap();
        task
    }

    #[test]
    fn test_report_progress_persists_percent_and_stage() {
        let temp_dir = TempDir::new().unwrap();
        let store = RecordStore::new(temp_dir.path());
        let task = running_task(&store);
        let ctx = TaskContext::new(task.task_ref(), store.clone(), Arc::default());

        ctx.report_progress(150, Some("transcribing"));

        let loaded = store.read_task(&task.batch_id, &task.id).unwrap();
        assert_eq!(loaded.progress, 100);
        assert_eq!(loaded.stage.as_deref(), Some("transcribing"));
    }

    #[test]
    fn test_report_progress_swallows_errors() {
        let temp_dir = TempDir::new().unwrap();
        let store = RecordStore::new(temp_dir.path());
        let task_ref = TaskRef {
            batch_id: "missing".to_string(),
            task_id: "missing".to_string(),
        };
        let ctx = TaskContext::new(task_ref, store, Arc::default());

        // Must not panic
        ctx.report_progress(50, None);
    }

    #[test]
    fn test_report_progress_ignores_non_running_task() {
        let temp_dir = TempDir::new().unwrap();
        let store = RecordStore::new(temp_dir.path());
        let mut task = running_task(&store);
        task.status = TaskStatus::Canceled;
        store.write_task(&mut task).unwrap();

        let ctx = TaskContext::new(task.task_ref(), store.clone(), Arc::default());
        ctx.report_progress(70, Some("late"));

        let loaded = store.read_task(&task.batch_id, &task.id).unwrap();
        assert_eq!(loaded.progress, 0);
        assert_eq!(loaded.stage, None);
    }

    fn probe(store: &RecordStore, cache_dir: &std::path::Path) -> SourceProbeAnalyzer {
        use crate::cache::CacheSettings;
        use crate::status::test_support::NoopFetcher;
        use std::time::Duration;

        let settings = CacheSettings {
            dir: cache_dir.to_path_buf(),
            max_file_bytes: 1024,
            max_total_bytes: 4096,
            success_ttl: Duration::from_secs(60),
            failure_ttl: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(1),
            file_extension: "mp4".to_string(),
        };
        let cache = Arc::new(ContentCache::new(settings, Arc::new(NoopFetcher)));
        SourceProbeAnalyzer::new(cache, store.clone())
    }

    #[tokio::test]
    async fn test_probe_reports_upload_size() {
        let temp_dir = TempDir::new().unwrap();
        let store = RecordStore::new(temp_dir.path().join("batches"));
        let batch = store.create_batch("files").unwrap();
        store.save_upload(&batch.id, "clip.mp4", b"12345").unwrap();
        let task = store.create_task(&batch.id, TaskKind::File, "clip.mp4").unwrap();
        let ctx = TaskContext::new(task.task_ref(), store.clone(), Arc::default());

        let analyzer = probe(&store, &temp_dir.path().join("cache"));
        let result = analyzer.analyze(&task, &ctx).await.unwrap();
        assert_eq!(result["size_bytes"], 5);
        assert_eq!(result["source"], "clip.mp4");
    }

    #[tokio::test]
    async fn test_probe_url_failure_surfaces_cache_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = RecordStore::new(temp_dir.path().join("batches"));
        let task = running_task(&store);
        let ctx = TaskContext::new(task.task_ref(), store.clone(), Arc::default());

        let analyzer = probe(&store, &temp_dir.path().join("cache"));
        let err = analyzer.analyze(&task, &ctx).await.unwrap_err();
        assert!(matches!(err, AnalyzeError::Source(CacheError::FetchFailed { .. })));
    }

    #[test]
    fn test_check_canceled() {
        let temp_dir = TempDir::new().unwrap();
        let store = RecordStore::new(temp_dir.path());
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = TaskContext::new(
            TaskRef {
                batch_id: "b".to_string(),
                task_id: "t".to_string(),
            },
            store,
            flag.clone(),
        );

        assert!(ctx.check_canceled().is_ok());
        flag.store(true, Ordering::SeqCst);
        assert!(ctx.is_canceled());
        assert!(matches!(ctx.check_canceled(), Err(AnalyzeError::Canceled)));
    }
}
