//! Fetch backends for the content cache.
//!
//! A fetcher writes the bytes for one source URL to a destination path and
//! reports how many it wrote. The cache owns temp naming, timeouts and
//! cleanup; a fetcher only has to honor `max_bytes`.

pub mod http;
pub mod ytdlp;

pub use http::HttpFetcher;
pub use ytdlp::{build_ytdlp_command, YtDlpFetcher};

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

/// Error type for fetch operations
#[derive(Debug, Error)]
pub enum FetchError {
    /// The source is larger than the configured cap
    #[error("Source exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Origin answered with a non-success status
    #[error("Origin returned status {0}")]
    Status(u16),

    /// yt-dlp exited with a non-zero status
    #[error("yt-dlp failed with exit code: {0}")]
    ToolFailed(i32),

    /// yt-dlp was terminated by a signal
    #[error("yt-dlp was terminated by signal")]
    ToolTerminated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Downloads one source to a local path.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Write the source at `url` to `dest`, returning the byte count.
    ///
    /// Must fail with [`FetchError::TooLarge`] rather than write more than
    /// `max_bytes`. Leftover bytes at `dest` after an error are removed by the
    /// caller.
    async fn fetch(&self, url: &str, dest: &Path, max_bytes: u64) -> Result<u64, FetchError>;
}
