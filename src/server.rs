//! Operational HTTP endpoints.
//!
//! Observability only; nothing here controls the engine.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/started` | Start time and uptime |
//! | `GET`  | `/healthz` | Liveness probe |
//! | `GET`  | `/stats` | Bulk indexing counters (only with `stats = true`) |
//! | `GET`  | `/instance` | Process identity, enabled state, last checkpoint |
//!
//! `/instance` is answered by the event loop itself, so a stalled loop
//! shows up as a timeout:
//!
//! ```json
//! { "error": { "code": "timeout", "message": "event loop did not answer within 5s" } }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use docsync_core::models::OpTimestamp;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::coordinator::ProcessState;
use crate::stats::{IndexStats, StatsSnapshot};

const INSTANCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshot of the coordinator, produced by the event loop.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub enabled: bool,
    pub state: ProcessState,
    pub pid: u32,
    pub hostname: String,
    pub instance_id: String,
    pub resume_name: String,
    pub cluster_name: Option<String>,
    pub last_ts: OpTimestamp,
    pub last_ts_formatted: Option<String>,
}

/// A pending `/instance` request waiting for the event loop.
pub type InstanceRequest = oneshot::Sender<InstanceStatus>;

#[derive(Clone)]
struct AppState {
    started: DateTime<Utc>,
    stats: Option<Arc<IndexStats>>,
    instance: mpsc::Sender<InstanceRequest>,
}

/// Serve until `shutdown` fires. `stats` is `None` when statistics are off.
pub async fn run_server(
    addr: &str,
    stats: Option<Arc<IndexStats>>,
    instance: mpsc::Sender<InstanceRequest>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid http-server-addr: {}", addr))?;
    let app = router(AppState {
        started: Utc::now(),
        stats,
        instance,
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, "http server listening");
    serve(listener, app, shutdown).await
}

async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/started", get(handle_started))
        .route("/healthz", get(handle_healthz))
        .route("/instance", get(handle_instance));
    if state.stats.is_some() {
        app = app.route("/stats", get(handle_stats));
    }
    app.layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn unavailable(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "unavailable".to_string(),
        message: message.into(),
    }
}

fn timeout_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::REQUEST_TIMEOUT,
        code: "timeout".to_string(),
        message: message.into(),
    }
}

// ============ GET /started ============

#[derive(Serialize)]
struct StartedResponse {
    started: DateTime<Utc>,
    uptime_seconds: i64,
}

async fn handle_started(State(state): State<AppState>) -> Json<StartedResponse> {
    Json(StartedResponse {
        started: state.started,
        uptime_seconds: (Utc::now() - state.started).num_seconds(),
    })
}

// ============ GET /healthz ============

async fn handle_healthz() -> &'static str {
    "ok"
}

// ============ GET /stats ============

async fn handle_stats(State(state): State<AppState>) -> Result<Json<StatsSnapshot>, AppError> {
    state
        .stats
        .as_ref()
        .map(|s| Json(s.snapshot()))
        .ok_or_else(|| unavailable("stats are disabled"))
}

// ============ GET /instance ============

async fn handle_instance(State(state): State<AppState>) -> Result<Json<InstanceStatus>, AppError> {
    let (tx, rx) = oneshot::channel();
    state
        .instance
        .send(tx)
        .await
        .map_err(|_| unavailable("event loop has stopped"))?;
    match tokio::time::timeout(INSTANCE_TIMEOUT, rx).await {
        Ok(Ok(status)) => Ok(Json(status)),
        Ok(Err(_)) => Err(unavailable("event loop has stopped")),
        Err(_) => Err(timeout_error(format!(
            "event loop did not answer within {}s",
            INSTANCE_TIMEOUT.as_secs()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> InstanceStatus {
        InstanceStatus {
            enabled: true,
            state: ProcessState::Enabled,
            pid: 1,
            hostname: "h".into(),
            instance_id: "i".into(),
            resume_name: "default".into(),
            cluster_name: None,
            last_ts: OpTimestamp::new(5, 0),
            last_ts_formatted: None,
        }
    }

    async fn start(stats: Option<Arc<IndexStats>>) -> (String, CancellationToken) {
        let (tx, mut rx) = mpsc::channel::<InstanceRequest>(1);
        tokio::spawn(async move {
            while let Some(reply) = rx.recv().await {
                let _ = reply.send(status());
            }
        });
        let app = router(AppState {
            started: Utc::now(),
            stats,
            instance: tx,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, app, shutdown.clone()));
        (base, shutdown)
    }

    #[tokio::test]
    async fn test_instance_answered_by_loop() {
        let (base, shutdown) = start(None).await;
        let body: serde_json::Value = reqwest::get(format!("{}/instance", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["enabled"], true);
        assert_eq!(body["state"], "enabled");
        assert_eq!(body["resume_name"], "default");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stats_route_only_when_enabled() {
        let (base, shutdown) = start(None).await;
        let response = reqwest::get(format!("{}/stats", base)).await.unwrap();
        assert_eq!(response.status().as_u16(), 404);
        shutdown.cancel();

        let (base, shutdown) = start(Some(Arc::new(IndexStats::new()))).await;
        let body: serde_json::Value = reqwest::get(format!("{}/stats", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["flushed"], 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_healthz() {
        let (base, shutdown) = start(None).await;
        let text = reqwest::get(format!("{}/healthz", base))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(text, "ok");
        shutdown.cancel();
    }
}
