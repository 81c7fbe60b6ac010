//! yt-dlp backed downloads
//!
//! Builds and runs `yt-dlp` for platform URLs that need extraction rather
//! than a plain GET.

use super::{FetchError, Fetcher};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Format selector preferring a single progressive mp4 stream.
const FORMAT_SELECTOR: &str = "best[ext=mp4]/best";

/// Runs the `yt-dlp` binary found at `program`.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    program: PathBuf,
}

impl Default for YtDlpFetcher {
    fn default() -> Self {
        Self {
            program: PathBuf::from("yt-dlp"),
        }
    }
}

impl YtDlpFetcher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

/// Build a yt-dlp command that downloads `url` to exactly `dest`
///
/// Creates a Command configured with:
/// - Output path fixed to `dest` (no templating)
/// - `--max-filesize` so yt-dlp aborts oversized sources
/// - No `.part` files or mtime rewriting, since the caller owns temp naming
/// - Quiet, non-interactive output
pub fn build_ytdlp_command(program: &Path, url: &str, dest: &Path, max_bytes: u64) -> Command {
    let mut cmd = Command::new(program);

    cmd.arg("-f").arg(FORMAT_SELECTOR);
    cmd.arg("-o").arg(dest);
    cmd.arg("--max-filesize").arg(max_bytes.to_string());
    cmd.arg("--no-part");
    cmd.arg("--no-mtime");
    cmd.arg("--no-playlist");
    cmd.arg("--quiet");
    cmd.arg("--no-progress");
    // Keep option parsing away from the URL
    cmd.arg("--").arg(url);

    cmd.kill_on_drop(true);
    cmd
}

#[async_trait]
impl Fetcher for YtDlpFetcher {
    async fn fetch(&self, url: &str, dest: &Path, max_bytes: u64) -> Result<u64, FetchError> {
        let mut cmd = build_ytdlp_command(&self.program, url, dest, max_bytes);
        let status = cmd.status().await?;

        if !status.success() {
            return match status.code() {
                Some(code) => Err(FetchError::ToolFailed(code)),
                None => Err(FetchError::ToolTerminated),
            };
        }

        // yt-dlp exits 0 after skipping a file over --max-filesize
        let size = match tokio::fs::metadata(dest).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::TooLarge { limit: max_bytes })
            }
            Err(e) => return Err(e.into()),
        };
        if size > max_bytes {
            return Err(FetchError::TooLarge { limit: max_bytes });
        }

        debug!(url = %url, bytes = size, "yt-dlp download finished");
        Ok(size)
    }
}
