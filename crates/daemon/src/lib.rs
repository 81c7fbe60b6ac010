//! reelq
//!
//! Durable task queue with a bounded worker pool, plus a single-flight
//! content cache that materializes source URLs as local files.

pub mod analyzer;
pub mod atomic;
pub mod cache;
pub mod concurrency;
pub mod daemon;
pub mod fetch;
pub mod pool;
pub mod records;
pub mod recovery;
pub mod status;
pub mod status_server;
pub mod store;
pub mod video_id;

pub use reelq_config as config;
pub use reelq_config::Config;
pub use analyzer::{AnalyzeError, Analyzer, SourceProbeAnalyzer, TaskContext};
pub use cache::{
    validate_token, CacheError, CacheSettings, CacheStats, CachedMedia, ContentCache, SweepReport,
};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{fetcher_for, Daemon, DaemonError};
pub use fetch::{build_ytdlp_command, FetchError, Fetcher, HttpFetcher, YtDlpFetcher};
pub use pool::{PoolError, PoolStats, WorkerPool};
pub use records::{
    Batch, BatchCounts, BatchStatus, Counter, ResultRecord, Task, TaskKind, TaskRef, TaskStatus,
};
pub use recovery::{find_unfinished_tasks, recover_tasks, recover_tasks_except};
pub use status::{StatusSnapshot, StatusSource};
pub use status_server::{create_status_router, run_status_server, ServerError};
pub use store::{ListQuery, RecordStore, StoreError, TaskPage, DEFAULT_PAGE_LIMIT};
pub use video_id::extract_video_id;
