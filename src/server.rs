//! HTTP control surface.
//!
//! Minimal observability for the single-session orchestrator: health,
//! state, a diagnostics snapshot, an opt-in process-memory probe, and a
//! binary WebSocket that mirrors the output PCM to remote listeners
//! (no auth; bind to the LAN only).

use crate::config::ServerConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::coordinator::DiagnosticsHandle;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use std::sync::atomic::Ordering;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Clone)]
struct AppState {
    diag: DiagnosticsHandle,
}

/// Build the router. Split from [`run_server`] so tests can exercise the
/// handlers without a socket.
pub fn router(config: &ServerConfig, diag: DiagnosticsHandle) -> Router {
    let state = AppState { diag };
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/state", get(current_state))
        .route("/diagnostics", get(diagnostics))
        .route("/ws/audio", get(ws_audio));
    if config.memory_endpoint {
        app = app.route("/memory", get(memory_snapshot));
    }
    app.with_state(state)
}

/// Serve the control surface until the token fires.
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
pub async fn run_server(
    config: ServerConfig,
    diag: DiagnosticsHandle,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local = listener.local_addr()?;
    info!("control surface listening on http://{local}");

    let app = router(&config, diag);
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| VoiceError::Io(std::io::Error::other(e)))
}

fn state_name(state: &AppState) -> &'static str {
    state
        .diag
        .state
        .lock()
        .map(|s| s.state().as_str())
        .unwrap_or("unknown")
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "state": state_name(&state),
    }))
}

async fn current_state(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "state": state_name(&state) }))
}

async fn diagnostics(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "state": state_name(&state),
        "background_task_count": state.diag.registry.count(),
        "audio_queue_occupancy": state.diag.staging_gauge.load(Ordering::SeqCst),
        "db_pool_free": state.diag.memory.pool_free(),
        "audio_listeners": state.diag.audio_broadcast.receiver_count(),
    }))
}

async fn memory_snapshot() -> impl IntoResponse {
    Json(serde_json::json!({ "rss_kb": process_rss_kb() }))
}

/// Resident set size in KiB, best-effort (Linux procfs).
fn process_rss_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status.lines().find_map(|line| {
        line.strip_prefix("VmRSS:")?
            .trim()
            .trim_end_matches(" kB")
            .trim()
            .parse()
            .ok()
    })
}

async fn ws_audio(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    let rx = state.diag.audio_broadcast.subscribe();
    upgrade.on_upgrade(move |socket| forward_audio(socket, rx))
}

/// Server-initiated binary stream of output PCM. Slow listeners that lag
/// behind the broadcast buffer simply miss frames.
async fn forward_audio(mut socket: WebSocket, mut rx: broadcast::Receiver<Bytes>) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if socket.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(missed, "audio listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
