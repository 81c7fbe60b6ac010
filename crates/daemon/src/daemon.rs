//! Daemon wiring and main loop for reelq
//!
//! Builds the record store, content cache and worker pool from configuration
//! and runs them until shutdown.

use crate::analyzer::{Analyzer, SourceProbeAnalyzer};
use crate::cache::ContentCache;
use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError, FetcherKind};
use crate::fetch::{Fetcher, HttpFetcher, YtDlpFetcher};
use crate::pool::{PoolError, WorkerPool};
use crate::status::StatusSource;
use crate::status_server::{run_status_server, ServerError};
use crate::store::{RecordStore, StoreError};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// How long shutdown waits for executing tasks before leaving them to
/// recovery.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Fetch backend selected by configuration.
pub fn fetcher_for(kind: FetcherKind) -> Arc<dyn Fetcher> {
    match kind {
        FetcherKind::YtDlp => Arc::new(YtDlpFetcher::default()),
        FetcherKind::Http => Arc::new(HttpFetcher::new()),
    }
}

/// Daemon state containing all runtime components
pub struct Daemon {
    pub config: Config,
    pub concurrency_plan: ConcurrencyPlan,
    pub store: RecordStore,
    pub cache: Arc<ContentCache>,
    pub pool: WorkerPool,
}

impl Daemon {
    /// Load configuration (defaults plus environment when the file is
    /// missing) and build the daemon.
    pub fn from_config_file<P: AsRef<Path>>(path: P) -> Result<Self, DaemonError> {
        let config = Config::load_or_default(path)?;
        Ok(Self::new(config))
    }

    /// Build the daemon with the built-in analyzer and the configured
    /// fetcher.
    pub fn new(config: Config) -> Self {
        let fetcher = fetcher_for(config.cache.fetcher);
        let store = RecordStore::new(&config.store.data_dir);
        let cache = Arc::new(ContentCache::from_config(&config.cache, fetcher));
        let analyzer = Arc::new(SourceProbeAnalyzer::new(Arc::clone(&cache), store.clone()));
        Self::assemble(config, store, cache, analyzer)
    }

    /// Build the daemon around caller-supplied analyzer and fetcher.
    pub fn with_components(
        config: Config,
        analyzer: Arc<dyn Analyzer>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let store = RecordStore::new(&config.store.data_dir);
        let cache = Arc::new(ContentCache::from_config(&config.cache, fetcher));
        Self::assemble(config, store, cache, analyzer)
    }

    fn assemble(
        config: Config,
        store: RecordStore,
        cache: Arc<ContentCache>,
        analyzer: Arc<dyn Analyzer>,
    ) -> Self {
        let concurrency_plan = derive_plan(&config);
        let pool = WorkerPool::new(store.clone(), analyzer, concurrency_plan.budget());
        Self {
            config,
            concurrency_plan,
            store,
            cache,
            pool,
        }
    }

    pub fn status_source(&self) -> StatusSource {
        StatusSource::new(self.pool.clone(), Arc::clone(&self.cache))
    }

    /// Start the cache janitor on the configured interval.
    pub fn start_janitor(&self) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.config.cache.sweep_interval_secs.max(1));
        Arc::clone(&self.cache).spawn_janitor(interval)
    }

    /// Start the status server; it stops when `shutdown` fires or is dropped.
    pub fn start_status_server(
        &self,
        shutdown: oneshot::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let addr = self.config.server.bind_addr.clone();
        let source = self.status_source();
        tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown.await;
            };
            if let Err(e) = run_status_server(&addr, source, signal).await {
                error!(error = %e, "Status server stopped");
            }
        })
    }

    /// Recover unfinished work, run background services, and block until
    /// `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        info!(
            data_dir = %self.config.store.data_dir.display(),
            cache_dir = %self.config.cache.dir.display(),
            budget = self.concurrency_plan.budget(),
            total_cores = self.concurrency_plan.total_cores,
            "Daemon starting"
        );

        let recovered = self.pool.recover()?;
        info!(recovered, "Recovery finished");

        let janitor = self.start_janitor();
        let (server_tx, server_rx) = oneshot::channel();
        let server = self.start_status_server(server_rx);

        shutdown.await;
        info!("Shutdown requested");

        let _ = server_tx.send(());
        janitor.abort();

        if tokio::time::timeout(SHUTDOWN_GRACE, self.pool.wait_idle())
            .await
            .is_err()
        {
            let stats = self.pool.stats();
            warn!(
                running = stats.running,
                pending = stats.pending,
                "Tasks still active at shutdown; they will be recovered on next start"
            );
        }

        if let Err(e) = server.await {
            warn!(error = %e, "Status server task ended abnormally");
        }
        info!("Daemon stopped");
        Ok(())
    }

    /// Run until Ctrl-C.
    pub async fn run_with_server(&self) -> Result<(), DaemonError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await
    }
}
