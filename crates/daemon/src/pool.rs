//! Worker pool for analysis tasks.
//!
//! Task references wait in a FIFO pending list. [`WorkerPool::pump`] is the
//! only admission point: it starts executions while fewer than the budget are
//! running, and every finished execution frees its slot and pumps again. A
//! task id is tracked from enqueue until its execution settles, and a second
//! enqueue of a tracked id is ignored, so one id never runs twice at once.

use crate::analyzer::{AnalyzeError, Analyzer, TaskContext};
use crate::records::{
    current_timestamp_ms, Counter, ResultRecord, Task, TaskKind, TaskRef, TaskStatus,
};
use crate::recovery::recover_tasks_except;
use crate::store::{RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn, Instrument};

/// Error type for pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Only terminal tasks can be retried
    #[error("Task {task_id} is {status} and cannot be retried")]
    NotRetryable { task_id: String, status: TaskStatus },
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub budget: usize,
    pub running: usize,
    pub pending: usize,
}

#[derive(Default)]
struct PoolState {
    pending: VecDeque<TaskRef>,
    /// Ids that are pending or executing
    tracked: HashSet<String>,
    running: usize,
    cancel_flags: HashMap<String, Arc<AtomicBool>>,
}

impl PoolState {
    fn is_idle(&self) -> bool {
        self.running == 0 && self.pending.is_empty()
    }
}

struct PoolInner {
    store: RecordStore,
    analyzer: Arc<dyn Analyzer>,
    budget: usize,
    state: Mutex<PoolState>,
    idle: Notify,
}

/// Bounded-concurrency task runner. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

/// Releases an execution slot when dropped, including on panic.
struct SlotGuard {
    inner: Arc<PoolInner>,
    task_id: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.release(&self.task_id);
    }
}

impl WorkerPool {
    /// Create a pool executing at most `budget` tasks at once (minimum 1).
    pub fn new(store: RecordStore, analyzer: Arc<dyn Analyzer>, budget: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                store,
                analyzer,
                budget: budget.max(1),
                state: Mutex::new(PoolState::default()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.inner.store
    }

    pub fn budget(&self) -> usize {
        self.inner.budget
    }

    /// Create a task in `batch_id` and queue it.
    pub fn submit(&self, batch_id: &str, kind: TaskKind, payload: &str) -> Result<Task, PoolError> {
        let task = self.inner.store.create_task(batch_id, kind, payload)?;
        if let Err(e) = self.inner.store.bump_batch_counter(batch_id, Counter::Queued) {
            warn!(batch_id = %batch_id, error = %e, "Failed to bump queued counter");
        }
        info!(batch_id = %batch_id, task_id = %task.id, kind = %kind, "Task submitted");
        self.enqueue(task.task_ref());
        Ok(task)
    }

    /// Append a reference to the pending list and pump.
    ///
    /// Returns `false` (and does nothing) if the id is already pending or
    /// executing.
    pub fn enqueue(&self, task_ref: TaskRef) -> bool {
        {
            let mut state = self.inner.lock_state();
            if !state.tracked.insert(task_ref.task_id.clone()) {
                debug!(task_id = %task_ref.task_id, "Task already tracked, ignoring enqueue");
                return false;
            }
            state.pending.push_back(task_ref);
        }
        self.pump();
        true
    }

    /// Start as many pending tasks as the budget allows. Never blocks.
    pub fn pump(&self) {
        self.inner.pump();
    }

    /// Request cooperative cancellation of a pending or executing task.
    ///
    /// Returns `false` if the pool is not tracking the id. The running
    /// analyzer only stops if it polls its [`TaskContext`].
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let mut state = self.inner.lock_state();
        if !state.tracked.contains(task_id) {
            return false;
        }
        state
            .cancel_flags
            .entry(task_id.to_string())
            .or_default()
            .store(true, Ordering::SeqCst);
        info!(task_id = %task_id, "Cancellation requested");
        true
    }

    /// Move a terminal task back to `queued` and enqueue it.
    pub fn retry_task(&self, batch_id: &str, task_id: &str) -> Result<Task, PoolError> {
        let mut task = self.inner.store.read_task(batch_id, task_id)?;
        let tracked = self.inner.lock_state().tracked.contains(task_id);
        if !task.status.is_terminal() || tracked {
            return Err(PoolError::NotRetryable {
                task_id: task_id.to_string(),
                status: task.status,
            });
        }

        task.requeue_for_retry();
        self.inner.store.write_task(&mut task)?;
        info!(batch_id = %batch_id, task_id = %task_id, retries = task.retries, "Task retried");
        self.enqueue(task.task_ref());
        Ok(task)
    }

    /// Re-enqueue every task left `queued` or `running` on disk.
    ///
    /// Tasks this pool is already tracking are left alone, so calling this
    /// more than once never duplicates work.
    pub fn recover(&self) -> Result<usize, PoolError> {
        let skip = self.inner.lock_state().tracked.clone();
        let count = recover_tasks_except(&self.inner.store, &skip, |task_ref| {
            self.enqueue(task_ref)
        })?;
        Ok(count)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock_state();
        PoolStats {
            budget: self.inner.budget,
            running: state.running,
            pending: state.pending.len(),
        }
    }

    /// Resolves once nothing is pending or executing.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.lock_state().is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pump(self: &Arc<Self>) {
        let mut to_start = Vec::new();
        {
            let mut state = self.lock_state();
            while state.running < self.budget {
                let Some(task_ref) = state.pending.pop_front() else {
                    break;
                };
                state.running += 1;
                let flag = state
                    .cancel_flags
                    .entry(task_ref.task_id.clone())
                    .or_default()
                    .clone();
                to_start.push((task_ref, flag));
            }
        }

        for (task_ref, flag) in to_start {
            let inner = Arc::clone(self);
            let span = tracing::info_span!(
                "task",
                batch_id = %task_ref.batch_id,
                task_id = %task_ref.task_id
            );
            tokio::spawn(
                async move {
                    let _slot = SlotGuard {
                        inner: Arc::clone(&inner),
                        task_id: task_ref.task_id.clone(),
                    };
                    inner.run_task(&task_ref, flag).await;
                }
                .instrument(span),
            );
        }
    }

    fn release(self: &Arc<Self>, task_id: &str) {
        let idle = {
            let mut state = self.lock_state();
            state.running = state.running.saturating_sub(1);
            state.tracked.remove(task_id);
            state.cancel_flags.remove(task_id);
            state.is_idle()
        };
        if idle {
            self.idle.notify_waiters();
        }
        self.pump();
    }

    /// Execute one task and persist its terminal state.
    async fn run_task(&self, task_ref: &TaskRef, cancel: Arc<AtomicBool>) {
        let mut task = match self.store.read_task(&task_ref.batch_id, &task_ref.task_id) {
            Ok(task) => task,
            Err(e) => {
                warn!(error = %e, "Dropping task that cannot be read");
                return;
            }
        };

        if task.status == TaskStatus::Canceled {
            info!("Task canceled before start, skipping");
            return;
        }
        if task.status.is_terminal() {
            debug!(status = %task.status, "Task already settled, skipping");
            return;
        }
        if cancel.load(Ordering::SeqCst) {
            task.status = TaskStatus::Canceled;
            task.error = Some("Canceled before start".to_string());
            if let Err(e) = self.store.write_task(&mut task) {
                error!(error = %e, "Failed to persist cancellation");
            }
            info!("Task canceled before start");
            return;
        }

        task.status = TaskStatus::Running;
        task.progress = 0;
        task.stage = None;
        task.error = None;
        if let Err(e) = self.store.write_task(&mut task) {
            error!(error = %e, "Failed to mark task running, leaving it for recovery");
            return;
        }
        if let Err(e) = self.store.bump_batch_counter(&task.batch_id, Counter::Running) {
            warn!(error = %e, "Failed to bump running counter");
        }
        info!(kind = %task.kind, retries = task.retries, "Task started");

        let ctx = TaskContext::new(task_ref.clone(), self.store.clone(), Arc::clone(&cancel));
        let outcome = self.analyzer.analyze(&task, &ctx).await;

        // Keep the latest stage the analyzer reported
        if let Ok(latest) = self.store.read_task(&task.batch_id, &task.id) {
            task.stage = latest.stage;
        }

        let outcome = outcome.and_then(|data| {
            let record = ResultRecord {
                task_id: task.id.clone(),
                batch_id: task.batch_id.clone(),
                created_at: current_timestamp_ms(),
                data,
            };
            self.store
                .write_result(&record)
                .map_err(|e| AnalyzeError::failed(format!("Failed to persist result: {}", e)))
        });

        let counter = match outcome {
            Ok(result_path) => {
                task.status = TaskStatus::Success;
                task.progress = 100;
                task.error = None;
                task.result_path = Some(result_path.to_string_lossy().into_owned());
                info!("Task succeeded");
                Counter::Success
            }
            Err(e) => {
                let canceled = cancel.load(Ordering::SeqCst) || matches!(e, AnalyzeError::Canceled);
                task.status = if canceled {
                    TaskStatus::Canceled
                } else {
                    TaskStatus::Failed
                };
                task.error = Some(e.to_string());
                if canceled {
                    info!("Task canceled");
                } else {
                    warn!(error = %e, "Task failed");
                }
                Counter::Failed
            }
        };

        if let Err(e) = self.store.write_task(&mut task) {
            error!(error = %e, status = %task.status, "Failed to persist task outcome");
            return;
        }
        if let Err(e) = self.store.bump_batch_counter(&task.batch_id, counter) {
            warn!(error = %e, "Failed to bump batch counter");
        }
    }
}
