//! Status snapshots for the daemon
//!
//! A snapshot is computed on demand from the live pool and cache; nothing is
//! cached between requests.

use crate::cache::{CacheStats, ContentCache};
use crate::pool::{PoolStats, WorkerPool};
use crate::records::current_timestamp_ms;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Point-in-time view of the daemon's two engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub pool: PoolStats,
    pub cache: CacheStats,
}

/// Handles the status endpoint reads from.
#[derive(Clone)]
pub struct StatusSource {
    pool: WorkerPool,
    cache: Arc<ContentCache>,
}

impl StatusSource {
    pub fn new(pool: WorkerPool, cache: Arc<ContentCache>) -> Self {
        Self { pool, cache }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            timestamp_unix_ms: current_timestamp_ms(),
            pool: self.pool.stats(),
            cache: self.cache.stats(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::analyzer::{AnalyzeError, Analyzer, TaskContext};
    use crate::cache::CacheSettings;
    use crate::fetch::{FetchError, Fetcher};
    use crate::records::Task;
    use crate::store::RecordStore;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;

    pub struct NoopAnalyzer;

    #[async_trait]
    impl Analyzer for NoopAnalyzer {
        async fn analyze(
            &self,
            _task: &Task,
            _ctx: &TaskContext,
        ) -> Result<serde_json::Value, AnalyzeError> {
            Ok(serde_json::Value::Null)
        }
    }

    pub struct NoopFetcher;

    #[async_trait]
    impl Fetcher for NoopFetcher {
        async fn fetch(&self, _url: &str, _dest: &Path, _max: u64) -> Result<u64, FetchError> {
            Err(FetchError::Status(503))
        }
    }

    /// A status source over an empty store and cache rooted at `dir`.
    pub fn status_source(dir: &Path) -> StatusSource {
        let store = RecordStore::new(dir.join("batches"));
        let pool = WorkerPool::new(store, Arc::new(NoopAnalyzer), 3);
        let settings = CacheSettings {
            dir: dir.join("cache"),
            max_file_bytes: 1024,
            max_total_bytes: 4096,
            success_ttl: Duration::from_secs(60),
            failure_ttl: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(1),
            file_extension: "mp4".to_string(),
        };
        let cache = Arc::new(ContentCache::new(settings, Arc::new(NoopFetcher)));
        StatusSource::new(pool, cache)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::status_source;
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_snapshot_reflects_pool_and_cache() {
        let temp_dir = TempDir::new().unwrap();
        let source = status_source(temp_dir.path());

        // A failing fetch leaves one failure marker behind
        assert!(source.cache.get_or_fetch("https://example.com/x").await.is_err());

        let snapshot = source.snapshot();
        assert!(snapshot.timestamp_unix_ms > 0);
        assert_eq!(snapshot.pool, PoolStats { budget: 3, running: 0, pending: 0 });
        assert_eq!(snapshot.cache.failure_markers, 1);
        assert_eq!(snapshot.cache.entries, 0);
        assert_eq!(snapshot.cache.in_flight, 0);
    }

    #[test]
    fn test_snapshot_json_field_names() {
        let snapshot = StatusSnapshot {
            timestamp_unix_ms: 1,
            pool: PoolStats { budget: 2, running: 1, pending: 4 },
            cache: CacheStats { entries: 5, failure_markers: 1, in_flight: 0 },
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["pool"]["pending"], 4);
        assert_eq!(json["cache"]["failure_markers"], 1);
        assert_eq!(json["timestamp_unix_ms"], 1);
    }
}
