//! CLI action handlers.
//!
//! One JSON object per connection, `action` selects the handler, and every
//! handler answers `{ok, ...}`. Port actions relay to the target container
//! over the control channel.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::clipboard;
use crate::error::DaemonError;
use crate::library;
use crate::naming;
use crate::notify::NotifyRequest;
use crate::ports;

use super::state::SESSION_METADATA_MAX_AGE;
use super::Daemon;

/// Dispatch one parsed CLI request.
pub async fn handle_action(daemon: &Arc<Daemon>, request: Value) -> Value {
    let Some(action) = request.get("action").and_then(Value::as_str) else {
        debug!("Message without action");
        return json!({"ok": false, "error": "missing_action"});
    };
    debug!("Action={action}");

    match action {
        "notify" => {
            daemon
                .notifier
                .dispatch(&daemon.state, NotifyRequest::from_payload(&request))
                .await
        }
        "clipboard" => handle_clipboard(&request).await,
        "add_host_port" => handle_add_host_port(daemon, &request).await,
        "add_container_port" => handle_add_container_port(daemon, &request).await,
        "remove_host_port" => handle_remove_host_port(daemon, &request).await,
        "remove_container_port" => handle_remove_container_port(daemon, &request).await,
        "get_completions" => handle_get_completions(daemon, &request).await,
        "get_active_ports" => handle_get_active_ports(daemon),
        "check_port" => handle_check_port(daemon, &request).await,
        other => DaemonError::UnknownAction(other.to_string()).to_response(),
    }
}

async fn handle_clipboard(request: &Value) -> Value {
    let data = request.get("data").and_then(Value::as_str).unwrap_or("");
    let selection = request
        .get("selection")
        .and_then(Value::as_str)
        .unwrap_or("primary");

    match clipboard::set(data, selection).await {
        Ok(()) => json!({"ok": true}),
        Err(e) => e.to_response(),
    }
}

fn port_fields(request: &Value) -> Result<(String, u16, u16), DaemonError> {
    let container = request
        .get("container")
        .and_then(Value::as_str)
        .ok_or(DaemonError::MissingField("container"))?
        .to_string();
    let host_port = request
        .get("host_port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .ok_or(DaemonError::MissingField("host_port"))?;
    let container_port = request
        .get("container_port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(host_port);
    Ok((container, host_port, container_port))
}

/// Expose a container port on the host (remote forward).
async fn handle_add_host_port(daemon: &Arc<Daemon>, request: &Value) -> Value {
    let (container, host_port, container_port) = match port_fields(request) {
        Ok(fields) => fields,
        Err(e) => return e.to_response(),
    };

    // Refuse ports the engine already publishes for another container.
    if let Some(docker) = &daemon.docker {
        if let Some(owner) = ports::docker_port_conflict(docker, host_port).await {
            return DaemonError::PortConflict {
                port: host_port,
                used_by: json!({"type": "docker", "container": owner}),
            }
            .to_response();
        }
    }

    let Some(conn) = daemon.tunnel.connection(&container) else {
        return DaemonError::SshDisconnected(container).to_response();
    };

    // Allow the upcoming SSH-level forward and record its metadata before
    // asking the container to initiate it.
    let name = format!("dynamic-{host_port}");
    daemon.tunnel.add_allowed_port(host_port);
    conn.expect_remote(host_port, container_port, &name);

    let response = daemon
        .tunnel
        .request_to_container(
            &container,
            "port_add",
            json!({
                "direction": "remote",
                "host_port": host_port,
                "container_port": container_port,
                "name": name,
            }),
            daemon.request_timeout(),
        )
        .await;

    match response {
        Ok(response) if response.get("ok") == Some(&json!(true)) => {
            json!({"ok": true, "message": format!("Port {host_port} exposed via SSH tunnel")})
        }
        Ok(response) => json!({
            "ok": false,
            "error": response.get("error").cloned().unwrap_or_else(|| json!("unknown error")),
        }),
        Err(e) => e.to_response(),
    }
}

/// Forward a host port into the container (local forward).
async fn handle_add_container_port(daemon: &Arc<Daemon>, request: &Value) -> Value {
    let (container, host_port, container_port) = match port_fields(request) {
        Ok(fields) => fields,
        Err(e) => return e.to_response(),
    };

    let Some(conn) = daemon.tunnel.connection(&container) else {
        return DaemonError::SshDisconnected(container).to_response();
    };

    // The listener lives on the container side; the host only needs to
    // accept the direct-tcpip target and record the mapping for display.
    daemon.tunnel.add_allowed_port(host_port);

    let response = daemon
        .tunnel
        .request_to_container(
            &container,
            "port_add",
            json!({
                "direction": "local",
                "host_port": host_port,
                "container_port": container_port,
                "name": format!("dynamic-{host_port}"),
            }),
            daemon.request_timeout(),
        )
        .await;

    match response {
        Ok(response) if response.get("ok") == Some(&json!(true)) => {
            let record = crate::tunnel::ForwardRecord::new(
                host_port,
                container_port,
                "127.0.0.1",
                &format!("dynamic-{host_port}"),
            );
            let mut forwards = conn.local_forwards.lock();
            forwards.retain(|f| f.host_port != host_port);
            forwards.push(record);
            drop(forwards);
            json!({"ok": true, "message": format!("Host port {host_port} forwarded into container")})
        }
        Ok(response) => json!({
            "ok": false,
            "error": response.get("error").cloned().unwrap_or_else(|| json!("unknown error")),
        }),
        Err(e) => e.to_response(),
    }
}

async fn handle_remove_host_port(daemon: &Arc<Daemon>, request: &Value) -> Value {
    let (container, host_port, _) = match port_fields(request) {
        Ok(fields) => fields,
        Err(e) => return e.to_response(),
    };

    let Some(conn) = daemon.tunnel.connection(&container) else {
        return DaemonError::SshDisconnected(container).to_response();
    };

    let response = daemon
        .tunnel
        .request_to_container(
            &container,
            "port_remove",
            json!({"direction": "remote", "host_port": host_port}),
            daemon.request_timeout(),
        )
        .await;

    match response {
        Ok(response) if response.get("ok") == Some(&json!(true)) => {
            // The container cancels its SSH forward; pruning here keeps the
            // record consistent even if that never arrives.
            conn.remove_remote_forward(host_port);
            daemon.tunnel.remove_allowed_port(host_port);
            json!({"ok": true, "message": format!("Port {host_port} unexposed")})
        }
        Ok(response) => json!({
            "ok": false,
            "error": response.get("error").cloned().unwrap_or_else(|| json!("unknown error")),
        }),
        Err(e) => e.to_response(),
    }
}

async fn handle_remove_container_port(daemon: &Arc<Daemon>, request: &Value) -> Value {
    let (container, host_port, _) = match port_fields(request) {
        Ok(fields) => fields,
        Err(e) => return e.to_response(),
    };

    let Some(conn) = daemon.tunnel.connection(&container) else {
        return DaemonError::SshDisconnected(container).to_response();
    };

    let response = daemon
        .tunnel
        .request_to_container(
            &container,
            "port_remove",
            json!({"direction": "local", "host_port": host_port}),
            daemon.request_timeout(),
        )
        .await;

    match response {
        Ok(response) if response.get("ok") == Some(&json!(true)) => {
            conn.prune_forward("local", host_port);
            daemon.tunnel.remove_allowed_port(host_port);
            json!({"ok": true, "message": format!("Port {host_port} unforwarded")})
        }
        Ok(response) => json!({
            "ok": false,
            "error": response.get("error").cloned().unwrap_or_else(|| json!("unknown error")),
        }),
        Err(e) => e.to_response(),
    }
}

/// Completion data for CLI tab-completion, served from in-memory caches.
pub async fn handle_get_completions(daemon: &Arc<Daemon>, request: &Value) -> Value {
    let comp_type = request.get("type").and_then(Value::as_str).unwrap_or("");
    let project = request.get("project").and_then(Value::as_str);

    match comp_type {
        "projects" => {
            let projects: Vec<String> = daemon
                .tunnel
                .connection_names()
                .iter()
                .filter_map(|name| naming::extract_project_name(name))
                .collect();
            json!({"ok": true, "projects": projects})
        }

        "sessions" => {
            let sessions: Vec<String> = match project {
                Some(project) => {
                    let container = format!(
                        "{}{}",
                        naming::CONTAINER_PREFIX,
                        naming::sanitize_name(project)
                    );
                    daemon
                        .state
                        .sessions_of(&container, SESSION_METADATA_MAX_AGE)
                        .into_iter()
                        .map(|s| s.name)
                        .collect()
                }
                None => daemon
                    .state
                    .all_sessions(SESSION_METADATA_MAX_AGE)
                    .into_iter()
                    .filter_map(|(container, sessions)| {
                        naming::extract_project_name(&container)
                            .map(|project| (project, sessions))
                    })
                    .flat_map(|(project, sessions)| {
                        sessions
                            .into_iter()
                            .map(move |s| format!("{project}/{}", s.name))
                    })
                    .collect(),
            };
            json!({"ok": true, "sessions": sessions})
        }

        "worktrees" => {
            let worktrees: Vec<String> = match project {
                Some(project) => {
                    let container = format!(
                        "{}{}",
                        naming::CONTAINER_PREFIX,
                        naming::sanitize_name(project)
                    );
                    daemon.state.worktrees_of(&container)
                }
                None => daemon
                    .state
                    .all_worktrees()
                    .into_iter()
                    .filter(|(container, _)| naming::extract_project_name(container).is_some())
                    .flat_map(|(_, worktrees)| worktrees)
                    .collect(),
            };
            json!({"ok": true, "worktrees": worktrees})
        }

        "mcp" => {
            let names = library::list_mcp_servers(&daemon.config.boxctl_dir());
            json!({"ok": true, "mcp_servers": names})
        }

        "skills" => {
            let names = library::list_skills(&daemon.config.boxctl_dir());
            json!({"ok": true, "skills": names})
        }

        "docker_containers" => {
            let include_boxctl = request
                .get("include_boxctl")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let names = match &daemon.docker {
                Some(docker) => match docker.list_containers(true).await {
                    Ok(containers) => containers
                        .into_iter()
                        .map(|c| c.name)
                        .filter(|name| {
                            include_boxctl || !name.starts_with(naming::CONTAINER_PREFIX)
                        })
                        .collect(),
                    Err(e) => {
                        debug!("Error listing docker containers: {e}");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };
            json!({"ok": true, "docker_containers": names})
        }

        other => DaemonError::UnknownType(other.to_string()).to_response(),
    }
}

/// Union of all forwards across live connections.
fn handle_get_active_ports(daemon: &Arc<Daemon>) -> Value {
    let mut host_ports = Vec::new();
    let mut container_ports = Vec::new();

    for conn in daemon.tunnel.connections_snapshot() {
        for forward in conn.remote_forwards.lock().iter() {
            host_ports.push(json!({
                "host_port": forward.host_port,
                "container_port": forward.container_port,
                "container": conn.name,
            }));
        }
        for forward in conn.local_forwards.lock().iter() {
            container_ports.push(json!({
                "host_port": forward.host_port,
                "container_port": forward.container_port,
                "container": conn.name,
            }));
        }
    }

    json!({"ok": true, "host_ports": host_ports, "container_ports": container_ports})
}

async fn handle_check_port(daemon: &Arc<Daemon>, request: &Value) -> Value {
    let Some(port) = request
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
    else {
        return DaemonError::MissingField("port").to_response();
    };

    let mut result = ports::check_port(&daemon.tunnel, port).await;
    result["ok"] = json!(true);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::daemon::state::SessionInfo;
    use tokio::sync::watch;

    fn test_daemon() -> Arc<Daemon> {
        let (_tx, rx) = watch::channel(vec!["127.0.0.1".to_string()]);
        Daemon::new(HostConfig::default(), rx)
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let daemon = test_daemon();
        let response = handle_action(&daemon, json!({"action": "frobnicate"})).await;
        assert_eq!(response["ok"], false);
        assert_eq!(response["error"], "unknown_action");
    }

    #[tokio::test]
    async fn test_missing_action() {
        let daemon = test_daemon();
        let response = handle_action(&daemon, json!({"data": "x"})).await;
        assert_eq!(response["ok"], false);
        assert_eq!(response["error"], "missing_action");
    }

    #[tokio::test]
    async fn test_add_host_port_requires_fields() {
        let daemon = test_daemon();
        let response = handle_action(&daemon, json!({"action": "add_host_port"})).await;
        assert_eq!(response["error"], "missing_field");
    }

    #[tokio::test]
    async fn test_add_host_port_disconnected_container() {
        let daemon = test_daemon();
        let response = handle_action(
            &daemon,
            json!({"action": "add_host_port", "container": "boxctl-x", "host_port": 8123}),
        )
        .await;
        assert_eq!(response["ok"], false);
        assert_eq!(response["error"], "ssh_disconnected");
    }

    #[tokio::test]
    async fn test_session_completions_follow_cache() {
        let daemon = test_daemon();
        daemon.state.update_sessions(
            "boxctl-x",
            vec![SessionInfo {
                name: "claude".into(),
                windows: 1,
                attached: true,
                agent_type: Some("claude".into()),
                identifier: None,
            }],
        );

        let response = handle_action(
            &daemon,
            json!({"action": "get_completions", "type": "sessions", "project": "x"}),
        )
        .await;
        assert_eq!(response["ok"], true);
        assert_eq!(response["sessions"], json!(["claude"]));

        // After the container's state is purged the same query is empty.
        daemon.state.purge_container("boxctl-x");
        let response = handle_action(
            &daemon,
            json!({"action": "get_completions", "type": "sessions", "project": "x"}),
        )
        .await;
        assert_eq!(response["sessions"], json!([]));
    }

    #[tokio::test]
    async fn test_session_completions_all_projects_prefixed() {
        let daemon = test_daemon();
        daemon.state.update_sessions(
            "boxctl-web",
            vec![SessionInfo {
                name: "shell".into(),
                windows: 1,
                attached: false,
                agent_type: None,
                identifier: None,
            }],
        );
        // Containers without the managed prefix never show up.
        daemon.state.update_sessions(
            "postgres",
            vec![SessionInfo {
                name: "ghost".into(),
                windows: 1,
                attached: false,
                agent_type: None,
                identifier: None,
            }],
        );

        let response = handle_action(
            &daemon,
            json!({"action": "get_completions", "type": "sessions"}),
        )
        .await;
        assert_eq!(response["sessions"], json!(["web/shell"]));
    }

    #[tokio::test]
    async fn test_unknown_completion_type() {
        let daemon = test_daemon();
        let response = handle_action(
            &daemon,
            json!({"action": "get_completions", "type": "galaxies"}),
        )
        .await;
        assert_eq!(response["ok"], false);
        assert_eq!(response["error"], "unknown_type");
    }

    #[tokio::test]
    async fn test_get_active_ports_empty() {
        let daemon = test_daemon();
        let response = handle_action(&daemon, json!({"action": "get_active_ports"})).await;
        assert_eq!(response["ok"], true);
        assert_eq!(response["host_ports"], json!([]));
        assert_eq!(response["container_ports"], json!([]));
    }

    #[tokio::test]
    async fn test_check_port_requires_port() {
        let daemon = test_daemon();
        let response = handle_action(&daemon, json!({"action": "check_port"})).await;
        assert_eq!(response["error"], "missing_field");
    }
}
