//! Control-channel handler registration.
//!
//! Containers reach the daemon through typed request/event messages on their
//! SSH control channel; this module wires every type to daemon state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::clipboard;
use crate::error::DaemonError;
use crate::notify::NotifyRequest;
use crate::tunnel::ForwardRecord;

use super::actions;
use super::state::{RateLimitEntry, SessionBuffer, SessionInfo};
use super::Daemon;

/// Shorthand for building a request-handler closure from an async fn.
macro_rules! request_handler {
    ($daemon:expr, $tunnel:expr, $name:literal, $func:path) => {{
        let d = $daemon.clone();
        $tunnel.register_request_handler(
            $name,
            Arc::new(move |container, payload| {
                let d = d.clone();
                Box::pin($func(d, container, payload))
            }),
        );
    }};
}

/// Shorthand for building an event-handler closure from an async fn.
macro_rules! event_handler {
    ($daemon:expr, $tunnel:expr, $name:literal, $func:path) => {{
        let d = $daemon.clone();
        $tunnel.register_event_handler(
            $name,
            Arc::new(move |container, payload| {
                let d = d.clone();
                Box::pin($func(d, container, payload))
            }),
        );
    }};
}

/// Register every request and event handler on the tunnel server.
pub fn register_all(daemon: &Arc<Daemon>) {
    let tunnel = daemon.tunnel.clone();

    // Request handlers (expect a response)
    request_handler!(daemon, tunnel, "notify", on_notify);
    request_handler!(daemon, tunnel, "clipboard_set", on_clipboard_set);
    request_handler!(daemon, tunnel, "get_completions", on_get_completions);
    request_handler!(daemon, tunnel, "port_add", on_port_add);
    request_handler!(daemon, tunnel, "port_remove", on_port_remove);
    request_handler!(daemon, tunnel, "ping", on_ping);
    request_handler!(daemon, tunnel, "check_agent", on_check_agent);
    request_handler!(daemon, tunnel, "get_usage_status", on_get_usage_status);
    request_handler!(daemon, tunnel, "clear_rate_limit", on_clear_rate_limit);

    // Event handlers (no response)
    event_handler!(daemon, tunnel, "stream_register", on_stream_register);
    event_handler!(daemon, tunnel, "stream_data", on_stream_data);
    event_handler!(daemon, tunnel, "stream_unregister", on_stream_unregister);
    event_handler!(daemon, tunnel, "state_update", on_state_update);
    event_handler!(daemon, tunnel, "forward_removed", on_forward_removed);
    event_handler!(
        daemon,
        tunnel,
        "local_forwards_registered",
        on_local_forwards_registered
    );
    event_handler!(daemon, tunnel, "session_resumed", on_session_resumed);
    event_handler!(daemon, tunnel, "report_rate_limit", on_report_rate_limit);

    // Internal connection lifecycle
    event_handler!(daemon, tunnel, "_container_connect", on_container_connect);
    event_handler!(
        daemon,
        tunnel,
        "_container_disconnect",
        on_container_disconnect
    );

    debug!("Registered SSH control channel handlers");
}

// ============================================================================
// Requests
// ============================================================================

async fn on_notify(daemon: Arc<Daemon>, _container: String, payload: Value) -> Value {
    daemon
        .notifier
        .dispatch(&daemon.state, NotifyRequest::from_payload(&payload))
        .await
}

async fn on_clipboard_set(_daemon: Arc<Daemon>, _container: String, payload: Value) -> Value {
    let data = payload.get("data").and_then(Value::as_str).unwrap_or("");
    let selection = payload
        .get("selection")
        .and_then(Value::as_str)
        .unwrap_or("clipboard");

    match clipboard::set(data, selection).await {
        Ok(()) => json!({"ok": true}),
        Err(e) => e.to_response(),
    }
}

async fn on_get_completions(daemon: Arc<Daemon>, _container: String, payload: Value) -> Value {
    let result = actions::handle_get_completions(&daemon, &payload).await;
    json!({"ok": true, "data": result})
}

/// A container asks to open a forward. The SSH protocol does the actual
/// binding; this updates the allowlist and records the port metadata.
async fn on_port_add(daemon: Arc<Daemon>, container: String, payload: Value) -> Value {
    let Some(host_port) = payload
        .get("host_port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
    else {
        return DaemonError::MissingField("host_port").to_response();
    };
    let container_port = payload
        .get("container_port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(host_port);
    let direction = payload
        .get("direction")
        .and_then(Value::as_str)
        .unwrap_or("remote");

    if direction == "remote" {
        // The allowlist entry comes from the CLI-side pre-approval; a
        // container cannot grant itself a host listener. It follows up
        // with an SSH tcpip_forward request.
        if let Some(conn) = daemon.tunnel.connection(&container) {
            let name = payload
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("dynamic");
            conn.expect_remote(host_port, container_port, name);
        }
        info!(
            "Container {container} requesting remote forward: host:{host_port} -> container:{container_port}"
        );
        json!({"ok": true, "data": {"host_port": host_port, "container_port": container_port}})
    } else {
        // Allow the direct-tcpip target so the SSH layer accepts the
        // container's forward onto this host port.
        daemon.tunnel.add_allowed_port(host_port);
        info!(
            "Container {container} requesting local forward: container:{container_port} -> host:{host_port}"
        );
        json!({"ok": true})
    }
}

async fn on_port_remove(daemon: Arc<Daemon>, container: String, payload: Value) -> Value {
    let Some(host_port) = payload
        .get("host_port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
    else {
        return DaemonError::MissingField("host_port").to_response();
    };
    let direction = payload
        .get("direction")
        .and_then(Value::as_str)
        .unwrap_or("remote");

    if let Some(conn) = daemon.tunnel.connection(&container) {
        conn.prune_forward(direction, host_port);
    }
    daemon.tunnel.remove_allowed_port(host_port);
    json!({"ok": true})
}

async fn on_ping(_daemon: Arc<Daemon>, _container: String, _payload: Value) -> Value {
    json!({"ok": true})
}

async fn on_check_agent(daemon: Arc<Daemon>, _container: String, payload: Value) -> Value {
    let agent = payload.get("agent").and_then(Value::as_str).unwrap_or("");
    if agent.is_empty() {
        return DaemonError::MissingField("agent").to_response();
    }

    let (available, resets_at) = daemon.state.check_agent(agent);
    if available {
        json!({"ok": true, "available": true})
    } else {
        json!({
            "ok": true,
            "available": false,
            "resets_at": resets_at.map(|t| t.to_rfc3339()),
        })
    }
}

async fn on_get_usage_status(daemon: Arc<Daemon>, _container: String, _payload: Value) -> Value {
    json!({"ok": true, "status": daemon.state.usage_status()})
}

async fn on_clear_rate_limit(daemon: Arc<Daemon>, _container: String, payload: Value) -> Value {
    let agent = payload.get("agent").and_then(Value::as_str).unwrap_or("");
    if agent.is_empty() {
        return DaemonError::MissingField("agent").to_response();
    }

    if daemon.state.clear_rate_limit(agent) {
        info!("Cleared rate limit state for {agent}");
    }
    json!({"ok": true})
}

// ============================================================================
// Events
// ============================================================================

fn session_of(payload: &Value) -> String {
    payload
        .get("session")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

async fn on_stream_register(daemon: Arc<Daemon>, container: String, payload: Value) {
    let session = session_of(&payload);
    debug!("Stream register: {container}/{session}");
    daemon.state.register_stream(&container, &session);
}

async fn on_stream_data(daemon: Arc<Daemon>, container: String, payload: Value) {
    let session = session_of(&payload);
    let data = SessionBuffer {
        buffer: payload
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        cursor_x: payload.get("cursor_x").and_then(Value::as_u64).unwrap_or(0) as u32,
        cursor_y: payload.get("cursor_y").and_then(Value::as_u64).unwrap_or(0) as u32,
        pane_width: payload
            .get("pane_width")
            .and_then(Value::as_u64)
            .unwrap_or(80) as u32,
        pane_height: payload
            .get("pane_height")
            .and_then(Value::as_u64)
            .unwrap_or(24) as u32,
    };

    // Store first, then fan out with no lock held. Subscribers are
    // documented as non-blocking; one failing must not starve the rest.
    let subscribers = daemon.state.store_stream_data(&container, &session, data.clone());
    for subscriber in subscribers {
        subscriber(&data);
    }
}

async fn on_stream_unregister(daemon: Arc<Daemon>, container: String, payload: Value) {
    let session = session_of(&payload);
    debug!("Stream unregister: {container}/{session}");
    daemon.state.unregister_stream(&container, &session);
}

async fn on_state_update(daemon: Arc<Daemon>, container: String, payload: Value) {
    if let Some(worktrees) = payload.get("worktrees") {
        match serde_json::from_value::<Vec<String>>(worktrees.clone()) {
            Ok(worktrees) => {
                debug!("State update: {container} worktrees={worktrees:?}");
                daemon.state.update_worktrees(&container, worktrees);
            }
            Err(e) => warn!("Malformed worktrees from {container}: {e}"),
        }
    }

    if let Some(sessions) = payload.get("sessions") {
        match serde_json::from_value::<Vec<SessionInfo>>(sessions.clone()) {
            Ok(sessions) => {
                debug!("State update: {container} sessions={}", sessions.len());
                daemon.state.update_sessions(&container, sessions);
            }
            Err(e) => warn!("Malformed sessions from {container}: {e}"),
        }
    }
}

/// A container tore down one of its forwards on its own; prune the record.
async fn on_forward_removed(daemon: Arc<Daemon>, container: String, payload: Value) {
    let Some(direction) = payload.get("direction").and_then(Value::as_str) else {
        return;
    };
    let Some(host_port) = payload
        .get("host_port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
    else {
        return;
    };

    if let Some(conn) = daemon.tunnel.connection(&container) {
        conn.prune_forward(direction, host_port);
        debug!("Removed {direction} forward tracking: {container}:{host_port}");
    }
}

/// Authoritative list of container-side (local) forwards, for display.
async fn on_local_forwards_registered(daemon: Arc<Daemon>, container: String, payload: Value) {
    let Some(forwards) = payload.get("forwards").and_then(Value::as_array) else {
        return;
    };
    if forwards.is_empty() {
        return;
    }

    let records: Vec<ForwardRecord> = forwards
        .iter()
        .filter_map(|forward| {
            let host_port = forward
                .get("host_port")
                .or_else(|| forward.get("port"))
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok())?;
            let container_port = forward
                .get("container_port")
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(host_port);
            let name = forward
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("registered");
            Some(ForwardRecord::new(host_port, container_port, "127.0.0.1", name))
        })
        .collect();

    if let Some(conn) = daemon.tunnel.connection(&container) {
        debug!("Registered {} local forwards for {container}", records.len());
        *conn.local_forwards.lock() = records;
    }
}

async fn on_session_resumed(daemon: Arc<Daemon>, container: String, payload: Value) {
    let session = payload
        .get("session")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    daemon
        .notifier
        .dismiss_for_session(&daemon.state, &container, &session)
        .await;
}

async fn on_report_rate_limit(daemon: Arc<Daemon>, container: String, payload: Value) {
    let agent = payload.get("agent").and_then(Value::as_str).unwrap_or("");
    if agent.is_empty() {
        return;
    }

    let limited = payload
        .get("limited")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let now = Utc::now();

    let resets_at = payload
        .get("resets_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .or_else(|| {
            payload
                .get("resets_in_seconds")
                .and_then(Value::as_f64)
                .map(|secs| now + chrono::Duration::milliseconds((secs * 1000.0) as i64))
        });

    info!("Rate limit reported for {agent} by {container}: resets_at={resets_at:?}");
    daemon.state.report_rate_limit(
        agent,
        RateLimitEntry {
            limited,
            detected_at: now,
            resets_at,
            error_type: payload
                .get("error_type")
                .and_then(Value::as_str)
                .map(String::from),
            reported_by: container,
        },
    );
}

async fn on_container_connect(_daemon: Arc<Daemon>, container: String, _payload: Value) {
    info!("SSH tunnel: container {container} ready");
}

/// Reap every cache entry for a departed container.
async fn on_container_disconnect(daemon: Arc<Daemon>, container: String, _payload: Value) {
    daemon.state.purge_container(&container);
    debug!("Purged cached state for {container}");
}
