//! Degraded-mode HTTP control shim.
//!
//! Loopback HTTP surface for group/select/url-test operations. The real
//! implementation needs a standalone connection to the engine's local
//! control socket, which the platform sandbox does not permit; every route
//! therefore answers a deterministic, machine-readable 503 instead of
//! hanging, crashing or claiming success. Unexpected internal errors are
//! mapped to 500 with the error text at the route boundary — nothing
//! escapes a handler.
//!
//! ## Routes
//! - `GET  /api/groups` — outbound group snapshot
//! - `GET  /api/active_groups` — groups currently routing traffic
//! - `POST /api/select` — switch the selected outbound in a group
//! - `POST /api/urltest` — trigger a latency test

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Route-boundary error. Every handler failure becomes one of these; the
/// response mapping below is the only way out of the shim.
#[derive(Debug, Error)]
pub enum ShimError {
    /// The engine's local control socket is unavailable on this platform.
    #[error("command server unavailable")]
    Unavailable,
    /// Anything unexpected, surfaced with its text.
    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    reason: String,
}

impl IntoResponse for ShimError {
    fn into_response(self) -> Response {
        match self {
            Self::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorBody {
                    error: "CommandServerUnavailable".to_string(),
                    reason: "local control sockets are blocked by the platform sandbox"
                        .to_string(),
                }),
            )
                .into_response(),
            Self::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: message,
                    reason: "internal error".to_string(),
                }),
            )
                .into_response(),
        }
    }
}

/// Gate shared by every handler. Local control sockets cannot be created
/// inside the platform sandbox, so the degradation is permanent on this
/// target; node switching stays available through other front-ends only.
fn command_socket() -> Result<(), ShimError> {
    Err(ShimError::Unavailable)
}

async fn get_groups() -> Result<Json<serde_json::Value>, ShimError> {
    command_socket()?;
    Ok(Json(serde_json::json!({ "groups": [] })))
}

async fn get_active_groups() -> Result<Json<serde_json::Value>, ShimError> {
    command_socket()?;
    Ok(Json(serde_json::json!({ "groups": [] })))
}

async fn select_outbound() -> Result<StatusCode, ShimError> {
    command_socket()?;
    Ok(StatusCode::NO_CONTENT)
}

async fn url_test() -> Result<StatusCode, ShimError> {
    command_socket()?;
    Ok(StatusCode::NO_CONTENT)
}

/// The shim's route table.
pub fn router() -> Router {
    Router::new()
        .route("/api/groups", get(get_groups))
        .route("/api/active_groups", get(get_active_groups))
        .route("/api/select", post(select_outbound))
        .route("/api/urltest", post(url_test))
}

/// The control shim HTTP server.
pub struct ControlShim {
    started: AtomicBool,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Default for ControlShim {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlShim {
    pub fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Bind and serve in the background, with oneshot graceful shutdown.
    pub async fn start(&self, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        self.started.store(true, Ordering::SeqCst);

        info!(target: "bh_core::shim", listen = %local, "control shim started (degraded mode)");

        let app = router();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!(target: "bh_core::shim", error = %e, "control shim server error");
            }
        });

        Ok(local)
    }

    pub fn close(&self) {
        self.started.store(false, Ordering::SeqCst);
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        } else {
            warn!(target: "bh_core::shim", "close without a running shim");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn every_route_answers_structured_503() {
        let routes = [
            ("GET", "/api/groups"),
            ("GET", "/api/active_groups"),
            ("POST", "/api/select"),
            ("POST", "/api/urltest"),
        ];
        for (method, uri) in routes {
            let response = router()
                .oneshot(
                    Request::builder()
                        .method(method)
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(
                response.status(),
                StatusCode::SERVICE_UNAVAILABLE,
                "{method} {uri}"
            );
            let body = body_json(response).await;
            assert_eq!(body["error"], "CommandServerUnavailable", "{method} {uri}");
            assert!(body["reason"].is_string(), "{method} {uri}");
        }
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/api/unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn internal_errors_map_to_500_with_text() {
        let response = ShimError::Internal("selector panicked".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "selector panicked");
    }

    #[tokio::test]
    async fn shim_server_starts_and_closes() {
        let shim = ControlShim::new();
        let addr = shim
            .start("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(shim.is_started());
        assert_eq!(shim.local_addr(), Some(addr));
        shim.close();
        assert!(!shim.is_started());
    }
}
