//! Plain HTTP(S) downloads.

use super::{FetchError, Fetcher};
use async_trait::async_trait;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Streams a URL body to disk with `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path, max_bytes: u64) -> Result<u64, FetchError> {
        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        // Reject early when the origin announces the size
        if let Some(len) = response.content_length() {
            if len > max_bytes {
                return Err(FetchError::TooLarge { limit: max_bytes });
            }
        }

        let mut file = File::create(dest).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            written += chunk.len() as u64;
            if written > max_bytes {
                return Err(FetchError::TooLarge { limit: max_bytes });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        debug!(url = %url, bytes = written, "HTTP download finished");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    async fn serve(body: &'static [u8]) -> String {
        let app = Router::new()
            .route("/clip", get(move || async move { body }))
            .route(
                "/missing",
                get(|| async { (axum::http::StatusCode::NOT_FOUND, "nope") }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_downloads_body() {
        let base = serve(b"0123456789").await;
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("clip.bin");

        let written = HttpFetcher::new()
            .fetch(&format!("{}/clip", base), &dest, 1024)
            .await
            .unwrap();

        assert_eq!(written, 10);
        assert_eq!(std::fs::read(&dest).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_rejects_oversized_body() {
        let base = serve(b"0123456789").await;
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("clip.bin");

        let err = HttpFetcher::new()
            .fetch(&format!("{}/clip", base), &dest, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { limit: 4 }));
    }

    #[tokio::test]
    async fn test_non_success_status() {
        let base = serve(b"").await;
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("clip.bin");

        let err = HttpFetcher::new()
            .fetch(&format!("{}/missing", base), &dest, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(404)));
        assert!(!dest.exists());
    }
}
