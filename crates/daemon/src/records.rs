//! Persisted record types: batches, tasks and results.
//!
//! These are the shapes written to disk by [`crate::store::RecordStore`].
//! Field names are serialized in snake_case and form part of the on-disk format.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Batch accepts and runs tasks.
    #[default]
    Active,
    /// Batch is kept for reference only.
    Archived,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Active => write!(f, "active"),
            BatchStatus::Archived => write!(f, "archived"),
        }
    }
}

/// Advisory tally of task outcomes within a batch.
///
/// Updated by read-modify-write without any cross-record transaction, so the
/// numbers may drift from the task files after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BatchCounts {
    pub queued: u64,
    pub running: u64,
    pub success: u64,
    pub failed: u64,
}

/// Which tally to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Queued,
    Running,
    Success,
    Failed,
}

impl BatchCounts {
    /// Increment one tally, saturating at `u64::MAX`.
    pub fn bump(&mut self, counter: Counter) {
        let slot = match counter {
            Counter::Queued => &mut self.queued,
            Counter::Running => &mut self.running,
            Counter::Success => &mut self.success,
            Counter::Failed => &mut self.failed,
        };
        *slot = slot.saturating_add(1);
    }
}

/// A named grouping of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Unique, immutable batch identifier (UUID).
    pub id: String,
    pub title: String,
    /// Unix timestamp (milliseconds) when the batch was created.
    pub created_at: i64,
    #[serde(default)]
    pub status: BatchStatus,
    #[serde(default)]
    pub counts: BatchCounts,
}

/// What a task's payload refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Payload is a remote source URL.
    Url,
    /// Payload is the name of a file under the batch's `uploads/` directory.
    File,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Url => write!(f, "url"),
            TaskKind::File => write!(f, "file"),
        }
    }
}

/// Status of a task.
///
/// `queued -> running -> {success, failed, canceled}`. A retry moves a terminal
/// task back to `queued`; `running -> queued` only happens during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    Running,
    Success,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// Success, failed and canceled are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// Queued and running tasks still need the pool.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" => Ok(TaskStatus::Canceled),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// One unit of submitted work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier (UUID), unique across all batches.
    pub id: String,
    pub batch_id: String,
    pub kind: TaskKind,
    /// Source URL or upload file name; opaque to the scheduler.
    pub payload: String,
    pub status: TaskStatus,
    /// Percent complete, 0..=100.
    pub progress: u8,
    /// Last stage label reported by the analyzer.
    #[serde(default)]
    pub stage: Option<String>,
    pub retries: u32,
    pub error: Option<String>,
    /// Location of the result file once the task succeeded.
    pub result_path: Option<String>,
    /// Unix timestamp (milliseconds) when the task was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) of the last write.
    pub updated_at: i64,
}

impl Task {
    /// A cheap handle used by the pool's pending list.
    pub fn task_ref(&self) -> TaskRef {
        TaskRef {
            batch_id: self.batch_id.clone(),
            task_id: self.id.clone(),
        }
    }

    /// Update the task's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    /// Set progress, clamped to 100.
    pub fn set_progress(&mut self, percent: u8) {
        self.progress = percent.min(100);
    }

    /// Reset to `queued` for another attempt.
    pub fn requeue_for_retry(&mut self) {
        self.status = TaskStatus::Queued;
        self.retries = self.retries.saturating_add(1);
        self.error = None;
        self.progress = 0;
        self.stage = None;
    }
}

/// Reference to a task as held by the pool's pending list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskRef {
    pub batch_id: String,
    pub task_id: String,
}

/// Output of a successful analysis, stored apart from the task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub task_id: String,
    pub batch_id: String,
    /// Unix timestamp (milliseconds) when the result was written.
    pub created_at: i64,
    pub data: serde_json::Value,
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
