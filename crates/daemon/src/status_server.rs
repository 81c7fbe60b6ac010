//! Status HTTP server
//!
//! Exposes `GET /status` for operators and health checks.

use axum::{extract::State, routing::get, Json, Router};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

use crate::status::{StatusSnapshot, StatusSource};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Status server failed: {0}")]
    Serve(std::io::Error),
}

/// Handler for GET /status
async fn get_status(State(source): State<StatusSource>) -> Json<StatusSnapshot> {
    Json(source.snapshot())
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(source: StatusSource) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(source)
}

/// Binds `addr` and serves the status router until `shutdown` resolves.
pub async fn run_status_server<F>(
    addr: &str,
    source: StatusSource,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    info!(addr = %addr, "Status server listening");

    axum::serve(listener, create_status_router(source))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::test_support::status_source;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_get_status_returns_json() {
        let temp_dir = TempDir::new().unwrap();
        let app = create_status_router(status_source(temp_dir.path()));

        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .expect("should have content-type header");
        assert!(content_type.to_str().unwrap().contains("application/json"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let snapshot: StatusSnapshot =
            serde_json::from_slice(&body).expect("should deserialize to StatusSnapshot");
        assert_eq!(snapshot.pool.budget, 3);
        assert_eq!(snapshot.pool.running, 0);
        assert_eq!(snapshot.cache.entries, 0);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let temp_dir = TempDir::new().unwrap();
        let app = create_status_router(status_source(temp_dir.path()));

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let err = run_status_server("not-an-address", status_source(temp_dir.path()), async {})
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
    }
}
