//! Transport server: axum routers bound to Unix domain sockets.
//!
//! The CLI and peer sockets share one router shape (`/command`, `/health`)
//! and differ only in which worker lane they feed. The publish socket
//! streams newline-delimited change notifications.

use std::convert::Infallible;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info};

use super::types::*;
use crate::daemon::ShutdownSignal;
use crate::protocol::Response;
use crate::publisher::Publisher;

/// Which request/reply channel a job arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Cli,
    Peer,
}

impl Lane {
    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Cli => "cli",
            Lane::Peer => "peer",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw request waiting for the worker, with the slot its reply goes to.
#[derive(Debug)]
pub struct Job {
    pub payload: Bytes,
    pub reply: oneshot::Sender<Response>,
}

struct CommandState {
    lane: Lane,
    queue: mpsc::Sender<Job>,
}

struct PublishState {
    publisher: Publisher,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

/// Router for a request/reply socket feeding `queue`.
pub fn command_router(lane: Lane, queue: mpsc::Sender<Job>) -> axum::Router {
    let state = Arc::new(CommandState { lane, queue });
    axum::Router::new()
        .route("/command", post(handle_command))
        .route("/health", get(handle_command_health))
        .with_state(state)
}

/// Router for the publish socket. Open event streams end when
/// `shutdown_tx` fires so that graceful shutdown can complete.
pub fn publish_router(
    publisher: Publisher,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
) -> axum::Router {
    let state = Arc::new(PublishState {
        publisher,
        shutdown_tx,
    });
    axum::Router::new()
        .route("/events", get(handle_events))
        .route("/health", get(handle_publish_health))
        .with_state(state)
}

/// Serve `app` on a Unix socket until the shutdown signal is received.
///
/// Removes any stale socket file before binding and removes the socket again
/// after the server has drained.
pub async fn serve(
    socket_path: &Path,
    app: axum::Router,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) -> Result<(), std::io::Error> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;

    std::fs::remove_file(socket_path).ok();
    info!(path = %socket_path.display(), "socket closed");
    Ok(())
}

// ── Route handlers ──────────────────────────────────────────────────────

fn unavailable() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: "daemon is shutting down".to_string(),
        }),
    )
}

async fn handle_command(
    State(state): State<Arc<CommandState>>,
    body: Bytes,
) -> Result<Json<Response>, (StatusCode, Json<ErrorResponse>)> {
    debug!(lane = %state.lane, bytes = body.len(), "request received");
    let (reply, rx) = oneshot::channel();
    state
        .queue
        .send(Job {
            payload: body,
            reply,
        })
        .await
        .map_err(|_| unavailable())?;
    rx.await.map(Json).map_err(|_| unavailable())
}

async fn handle_command_health(State(state): State<Arc<CommandState>>) -> Json<HealthResponse> {
    Json(HealthResponse::current(state.lane.as_str()))
}

async fn handle_publish_health() -> Json<HealthResponse> {
    Json(HealthResponse::current("publish"))
}

async fn handle_events(
    State(state): State<Arc<PublishState>>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    debug!(topic = ?query.topic, "subscriber attached");
    let events = state.publisher.stream(query.topic).map(Some);
    let stop = BroadcastStream::new(state.shutdown_tx.subscribe()).map(|_| None);
    let lines = events
        .merge(stop)
        .take_while(Option::is_some)
        .filter_map(|line| line)
        .map(|line| Ok::<_, Infallible>(Bytes::copy_from_slice(line.as_bytes())));

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
}
