//! Single-flight content cache.
//!
//! Turns a source URL into a local file at most once per TTL window. The
//! in-memory index maps URLs to either a cached file (keyed by a random
//! token, never the URL) or a short-lived failure marker. Concurrent misses
//! for one URL share a single in-flight fetch and all observe its outcome.
//!
//! On disk the cache is a flat directory of `<token>.<ext>` files. Downloads
//! land in `<token>.<ext>.part` and are renamed only after they succeed, so
//! nothing else ever sees a partial file. A janitor drops expired entries,
//! deletes `.part` files no live download owns, and then evicts
//! least-recently-used files (by mtime) until the directory fits its size
//! budget.

use crate::config::CacheConfig;
use crate::fetch::{FetchError, Fetcher};
use crate::video_id::extract_video_id;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PART_SUFFIX: &str = ".part";
const MAX_TOKEN_LEN: usize = 64;

/// Error type for cache operations
///
/// Cloneable because one fetch outcome is handed to every waiting caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("Fetch failed: {reason}")]
    FetchFailed { reason: String },

    /// A failure marker for this URL has not expired yet
    #[error("Source failed recently: {reason}")]
    RecentlyFailed { reason: String },

    #[error("Invalid token: {0:?}")]
    InvalidToken(String),

    #[error("Fetch timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Source exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("Source is empty")]
    Empty,

    #[error("IO error: {0}")]
    Io(String),
}

impl From<io::Error> for CacheError {
    fn from(e: io::Error) -> Self {
        CacheError::Io(e.to_string())
    }
}

impl From<FetchError> for CacheError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::TooLarge { limit } => CacheError::TooLarge { limit },
            other => CacheError::FetchFailed {
                reason: other.to_string(),
            },
        }
    }
}

/// Runtime cache policy.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub dir: PathBuf,
    pub max_file_bytes: u64,
    pub max_total_bytes: u64,
    pub success_ttl: Duration,
    pub failure_ttl: Duration,
    pub fetch_timeout: Duration,
    pub file_extension: String,
}

impl From<&CacheConfig> for CacheSettings {
    fn from(cfg: &CacheConfig) -> Self {
        Self {
            dir: cfg.dir.clone(),
            max_file_bytes: cfg.max_file_bytes,
            max_total_bytes: cfg.max_total_bytes,
            success_ttl: Duration::from_secs(cfg.success_ttl_secs),
            failure_ttl: Duration::from_secs(cfg.failure_ttl_secs),
            fetch_timeout: Duration::from_secs(cfg.fetch_timeout_secs),
            file_extension: cfg.file_extension.clone(),
        }
    }
}

/// A locally available source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedMedia {
    /// Opaque external identifier of the cached file.
    pub token_id: String,
    pub video_id: Option<String>,
    pub size: u64,
    /// True when served from the index without fetching.
    pub cache_hit: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
enum EntryOutcome {
    Ready {
        token_id: String,
        video_id: Option<String>,
        size: u64,
    },
    Failed(CacheError),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    outcome: EntryOutcome,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    fn token_id(&self) -> Option<&str> {
        match &self.outcome {
            EntryOutcome::Ready { token_id, .. } => Some(token_id),
            EntryOutcome::Failed(_) => None,
        }
    }
}

type FetchCell = Arc<OnceCell<Result<CachedMedia, CacheError>>>;

/// One URL's shared fetch and the number of callers waiting on it.
struct InFlight {
    cell: FetchCell,
    waiters: usize,
}

/// What a janitor pass reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Entries (success or failure) dropped because their TTL elapsed
    pub expired: usize,
    /// Files deleted to get under the size budget
    pub evicted: usize,
    /// Leftover `.part` files from abandoned or crashed downloads
    #[serde(default)]
    pub orphaned: usize,
    pub bytes_freed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub failure_markers: usize,
    pub in_flight: usize,
}

/// URL-keyed download cache with single-flight fetching.
pub struct ContentCache {
    settings: CacheSettings,
    fetcher: Arc<dyn Fetcher>,
    index: Mutex<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    /// Paths of downloads that are not indexed yet; the janitor skips them.
    downloading: Mutex<HashSet<PathBuf>>,
}

/// A caller's membership in the in-flight fetch for one URL.
///
/// The map entry goes away once the fetch has settled or the last waiter
/// has been dropped, so a canceled caller never strands it.
struct InFlightGuard<'a> {
    cache: &'a ContentCache,
    url: &'a str,
    cell: FetchCell,
}

impl<'a> InFlightGuard<'a> {
    fn join(cache: &'a ContentCache, url: &'a str) -> Self {
        let mut in_flight = lock(&cache.in_flight);
        let slot = in_flight.entry(url.to_string()).or_insert_with(|| InFlight {
            cell: FetchCell::default(),
            waiters: 0,
        });
        slot.waiters += 1;
        Self {
            cache,
            url,
            cell: Arc::clone(&slot.cell),
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.cache.in_flight);
        let Some(slot) = in_flight.get_mut(self.url) else {
            return;
        };
        if !Arc::ptr_eq(&slot.cell, &self.cell) {
            return;
        }
        slot.waiters = slot.waiters.saturating_sub(1);
        if slot.waiters == 0 || slot.cell.initialized() {
            in_flight.remove(self.url);
        }
    }
}

/// Claims a download's `.part` and final paths until it is indexed.
///
/// Dropping it deletes whatever `.part` file is left, including when the
/// fetching future is canceled mid-download.
struct DownloadGuard<'a> {
    cache: &'a ContentCache,
    part_path: PathBuf,
    final_path: PathBuf,
}

impl<'a> DownloadGuard<'a> {
    fn claim(cache: &'a ContentCache, final_path: PathBuf) -> Self {
        let part_path = ContentCache::part_path(&final_path);
        let mut downloading = lock(&cache.downloading);
        downloading.insert(part_path.clone());
        downloading.insert(final_path.clone());
        drop(downloading);
        Self {
            cache,
            part_path,
            final_path,
        }
    }
}

impl Drop for DownloadGuard<'_> {
    fn drop(&mut self) {
        remove_file_logged(&self.part_path);
        let mut downloading = lock(&self.cache.downloading);
        downloading.remove(&self.part_path);
        downloading.remove(&self.final_path);
    }
}

/// Checks a token against `[A-Za-z0-9_-]{1,64}`.
pub fn validate_token(token: &str) -> Result<(), CacheError> {
    let ok = !token.is_empty()
        && token.len() <= MAX_TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(CacheError::InvalidToken(token.to_string()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_file_logged(path: &Path) -> Option<u64> {
    let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    match fs::remove_file(path) {
        Ok(()) => Some(size),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to delete cache file");
            None
        }
    }
}

fn is_part_file(path: &Path) -> bool {
    path.to_string_lossy().ends_with(PART_SUFFIX)
}

fn touch(path: &Path) -> io::Result<()> {
    fs::File::options()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}

impl ContentCache {
    pub fn new(settings: CacheSettings, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            settings,
            fetcher,
            index: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            downloading: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(cfg: &CacheConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        Self::new(CacheSettings::from(cfg), fetcher)
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Deterministic location of the file for `token_id`.
    pub fn file_path(&self, token_id: &str) -> Result<PathBuf, CacheError> {
        validate_token(token_id)?;
        Ok(self
            .settings
            .dir
            .join(format!("{}.{}", token_id, self.settings.file_extension)))
    }

    fn part_path(final_path: &Path) -> PathBuf {
        let mut name = final_path.as_os_str().to_os_string();
        name.push(PART_SUFFIX);
        PathBuf::from(name)
    }

    /// Return a local file for `url`, fetching it at most once concurrently.
    pub async fn get_or_fetch(&self, url: &str) -> Result<CachedMedia, CacheError> {
        if let Some(hit) = self.lookup(url) {
            return hit;
        }

        let guard = InFlightGuard::join(self, url);
        let outcome = guard
            .cell
            .get_or_init(|| self.fetch_and_index(url))
            .await
            .clone();
        outcome
    }

    /// Consult the index. `None` means a fetch is needed.
    fn lookup(&self, url: &str) -> Option<Result<CachedMedia, CacheError>> {
        let now = Instant::now();
        let entry = {
            let mut index = lock(&self.index);
            let entry = index.get(url)?.clone();
            if !entry.is_live(now) {
                index.remove(url);
            }
            entry
        };

        if !entry.is_live(now) {
            if let Some(path) = entry.token_id().and_then(|t| self.file_path(t).ok()) {
                remove_file_logged(&path);
            }
            return None;
        }

        match entry.outcome {
            EntryOutcome::Failed(err) => Some(Err(CacheError::RecentlyFailed {
                reason: err.to_string(),
            })),
            EntryOutcome::Ready {
                token_id,
                video_id,
                size,
            } => {
                let path = self.file_path(&token_id).ok()?;
                match touch(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        // Evicted behind the index's back
                        self.forget(url, &token_id);
                        return None;
                    }
                    Err(e) => debug!(path = %path.display(), error = %e, "Failed to touch cache file"),
                }
                debug!(url = %url, token_id = %token_id, "Cache hit");
                Some(Ok(CachedMedia {
                    token_id,
                    video_id,
                    size,
                    cache_hit: true,
                    path,
                }))
            }
        }
    }

    /// Drop the index entry for `url` if it still points at `token_id`.
    fn forget(&self, url: &str, token_id: &str) {
        let mut index = lock(&self.index);
        if index.get(url).and_then(CacheEntry::token_id) == Some(token_id) {
            index.remove(url);
        }
    }

    /// The body of the single in-flight fetch for `url`.
    async fn fetch_and_index(&self, url: &str) -> Result<CachedMedia, CacheError> {
        // A fetch that settled between our lookup and joining the lock
        if let Some(hit) = self.lookup(url) {
            return hit;
        }

        let token_id = Uuid::new_v4().simple().to_string();
        let download = DownloadGuard::claim(self, self.file_path(&token_id)?);

        info!(url = %url, token_id = %token_id, "Fetching source");
        let result = self
            .download(url, &download.part_path, &download.final_path)
            .await;

        let now = Instant::now();
        match result {
            Ok(size) => {
                let video_id = extract_video_id(url);
                lock(&self.index).insert(
                    url.to_string(),
                    CacheEntry {
                        outcome: EntryOutcome::Ready {
                            token_id: token_id.clone(),
                            video_id: video_id.clone(),
                            size,
                        },
                        expires_at: now + self.settings.success_ttl,
                    },
                );
                info!(url = %url, token_id = %token_id, size, "Source cached");
                Ok(CachedMedia {
                    token_id,
                    video_id,
                    size,
                    cache_hit: false,
                    path: download.final_path.clone(),
                })
            }
            Err(err) => {
                lock(&self.index).insert(
                    url.to_string(),
                    CacheEntry {
                        outcome: EntryOutcome::Failed(err.clone()),
                        expires_at: now + self.settings.failure_ttl,
                    },
                );
                warn!(url = %url, error = %err, "Source fetch failed");
                Err(err)
            }
        }
    }

    async fn download(
        &self,
        url: &str,
        part_path: &Path,
        final_path: &Path,
    ) -> Result<u64, CacheError> {
        tokio::fs::create_dir_all(&self.settings.dir).await?;

        // A file bigger than the whole budget would be evicted on the next sweep
        let max_bytes = self
            .settings
            .max_file_bytes
            .min(self.settings.max_total_bytes);
        let fetch = self.fetcher.fetch(url, part_path, max_bytes);
        let size = match tokio::time::timeout(self.settings.fetch_timeout, fetch).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CacheError::Timeout {
                    secs: self.settings.fetch_timeout.as_secs(),
                })
            }
        };

        if size == 0 {
            return Err(CacheError::Empty);
        }
        if size > max_bytes {
            return Err(CacheError::TooLarge { limit: max_bytes });
        }

        // Synchronous so no cancellation point sits between rename and indexing
        fs::rename(part_path, final_path)?;
        Ok(size)
    }

    /// One janitor pass: expire entries, then evict oldest files over budget.
    ///
    /// Never fails; per-file errors are logged and skipped.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        // Expiry
        let now = Instant::now();
        let expired: Vec<CacheEntry> = {
            let mut index = lock(&self.index);
            let urls: Vec<String> = index
                .iter()
                .filter(|(_, entry)| !entry.is_live(now))
                .map(|(url, _)| url.clone())
                .collect();
            urls.iter().filter_map(|url| index.remove(url)).collect()
        };
        report.expired = expired.len();
        for entry in &expired {
            if let Some(path) = entry.token_id().and_then(|t| self.file_path(t).ok()) {
                if let Some(bytes) = remove_file_logged(&path) {
                    report.bytes_freed += bytes;
                }
            }
        }

        // Listed before the claim snapshot: a download claims its paths before
        // creating them and releases them only after they are gone or indexed
        let listed = self.list_cache_files();
        let downloading = lock(&self.downloading).clone();
        let (parts, mut files): (Vec<_>, Vec<_>) = listed
            .into_iter()
            .filter(|(path, _, _)| !downloading.contains(path))
            .partition(|(path, _, _)| is_part_file(path));

        // Orphaned partial downloads
        for (path, size, _) in parts {
            if remove_file_logged(&path).is_some() {
                report.orphaned += 1;
                report.bytes_freed += size;
            }
        }

        // Size budget
        let mut total: u64 = files.iter().map(|(_, size, _)| size).sum();
        if total > self.settings.max_total_bytes {
            files.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));
            let mut evicted_tokens = HashSet::new();
            for (path, size, _) in files {
                if total <= self.settings.max_total_bytes {
                    break;
                }
                if remove_file_logged(&path).is_none() {
                    continue;
                }
                total = total.saturating_sub(size);
                report.evicted += 1;
                report.bytes_freed += size;
                if let Some(token) = self.token_from_path(&path) {
                    evicted_tokens.insert(token);
                }
            }
            if !evicted_tokens.is_empty() {
                lock(&self.index)
                    .retain(|_, entry| entry.token_id().map_or(true, |t| !evicted_tokens.contains(t)));
            }
        }

        if report.expired > 0 || report.evicted > 0 || report.orphaned > 0 {
            info!(
                expired = report.expired,
                evicted = report.evicted,
                orphaned = report.orphaned,
                bytes_freed = report.bytes_freed,
                "Cache sweep finished"
            );
        }
        report
    }

    /// Every regular file in the cache dir as `(path, size, mtime)`,
    /// `.part` files included.
    fn list_cache_files(&self) -> Vec<(PathBuf, u64, SystemTime)> {
        let entries = match fs::read_dir(&self.settings.dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(dir = %self.settings.dir.display(), error = %e, "Failed to list cache dir");
                }
                return Vec::new();
            }
        };

        let mut files = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            match entry.metadata() {
                Ok(meta) if meta.is_file() => {
                    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    files.push((path, meta.len(), mtime));
                }
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to stat cache file"),
            }
        }
        files
    }

    fn token_from_path(&self, path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        let suffix = format!(".{}", self.settings.file_extension);
        name.strip_suffix(&suffix).map(str::to_string)
    }

    /// Run [`ContentCache::sweep`] every `interval` until the handle is
    /// aborted.
    pub fn spawn_janitor(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let cache = Arc::clone(&self);
                if let Err(e) = tokio::task::spawn_blocking(move || cache.sweep()).await {
                    warn!(error = %e, "Cache sweep panicked");
                }
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        let index = lock(&self.index);
        let failure_markers = index
            .values()
            .filter(|e| matches!(e.outcome, EntryOutcome::Failed(_)))
            .count();
        CacheStats {
            entries: index.len() - failure_markers,
            failure_markers,
            in_flight: lock(&self.in_flight).len(),
        }
    }
}
