//! Axum router over daemon state and the bind/rebind loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::daemon::Daemon;

fn build_router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(status))
        .route("/api/ports", get(ports))
        .route("/api/sessions/:container/:session", get(session_buffer))
        .route("/api/sessions/:container/:session/input", post(session_input))
        .layer(TraceLayer::new_for_http())
        .with_state(daemon)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(daemon): State<Arc<Daemon>>) -> Json<Value> {
    let mut body = daemon.tunnel_stats();
    body["connected_containers"] = json!(daemon.tunnel.connection_names());
    Json(body)
}

async fn ports(State(daemon): State<Arc<Daemon>>) -> Json<Value> {
    let mut exposed = Vec::new();
    let mut forwarded = Vec::new();

    for conn in daemon.tunnel.connections_snapshot() {
        for forward in conn.remote_forwards.lock().iter() {
            exposed.push(json!({
                "host_port": forward.host_port,
                "container_port": forward.container_port,
                "container": conn.name,
            }));
        }
        for forward in conn.local_forwards.lock().iter() {
            forwarded.push(json!({
                "host_port": forward.host_port,
                "container_port": forward.container_port,
                "container": conn.name,
            }));
        }
    }

    Json(json!({"exposed": exposed, "forwarded": forwarded}))
}

async fn session_buffer(
    State(daemon): State<Arc<Daemon>>,
    Path((container, session)): Path<(String, String)>,
) -> impl IntoResponse {
    match daemon.state.session_buffer(&container, &session) {
        Some(buffer) => Json(json!({
            "buffer": buffer.buffer,
            "cursor_x": buffer.cursor_x,
            "cursor_y": buffer.cursor_y,
            "pane_width": buffer.pane_width,
            "pane_height": buffer.pane_height,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "no buffer for session"})),
        )
            .into_response(),
    }
}

async fn session_input(
    State(daemon): State<Arc<Daemon>>,
    Path((container, session)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let keys = body.get("keys").and_then(Value::as_str).unwrap_or("");
    let literal = body.get("literal").and_then(Value::as_bool).unwrap_or(true);

    let sent = daemon.send_input(&container, &session, keys, literal).await;
    Json(json!({"ok": sent}))
}

/// Start the web server across the resolved hosts, restarting whenever the
/// Tailscale IP changes.
pub fn spawn(
    daemon: Arc<Daemon>,
    ip_rx: Option<watch::Receiver<Option<String>>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let ip = ip_rx.as_ref().map(|rx| rx.borrow().clone()).flatten();
            let hosts = daemon.config.web_server_hosts(ip.as_deref());
            let port = daemon.config.web_server.port;

            let generation = CancellationToken::new();
            for host in &hosts {
                let app = build_router(daemon.clone());
                let addr = format!("{host}:{port}");
                let stop = generation.clone();

                let listener = match tokio::net::TcpListener::bind(&addr).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        warn!("Web server failed to bind {addr}: {e}");
                        continue;
                    }
                };
                info!("Starting web server on {addr}");

                tokio::spawn(async move {
                    let served = axum::serve(listener, app)
                        .with_graceful_shutdown(async move { stop.cancelled().await });
                    if let Err(e) = served.await {
                        error!("Web server error: {e}");
                    }
                });
            }

            let restart = async {
                match ip_rx.clone() {
                    Some(mut rx) => {
                        let _ = rx.changed().await;
                    }
                    // No monitor: nothing to react to, park until shutdown.
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    generation.cancel();
                    return;
                }
                _ = restart => {
                    info!("Restarting web server due to binding changes...");
                    generation.cancel();
                    // Brief delay so the old listeners release their ports.
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });
}
