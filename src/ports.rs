//! Port conflict detection.
//!
//! A host port can be owned by a boxctl forward (checked against the live
//! connections), published by another engine container, or held by an
//! arbitrary external process (detected with `ss -tlnp`).

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::warn;

use crate::docker::DockerService;
use crate::tunnel::TunnelServer;

const SS_TIMEOUT: Duration = Duration::from_secs(5);

/// An external (non-boxctl) process listening on a port.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalListener {
    pub process: String,
    pub pid: Option<u32>,
}

fn users_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"users:\(\("([^"]+)",pid=(\d+)"#).expect("users pattern is valid")
    })
}

/// Parse `ss -tlnp` output for a single-port filter. The first line is the
/// header; a second line means something is listening.
pub fn parse_ss_output(output: &str) -> Option<ExternalListener> {
    let mut lines = output.trim().lines();
    let _header = lines.next()?;
    let line = lines.next()?;

    match users_pattern().captures(line) {
        Some(captures) => Some(ExternalListener {
            process: captures[1].to_string(),
            pid: captures[2].parse().ok(),
        }),
        None => Some(ExternalListener {
            process: "unknown".to_string(),
            pid: None,
        }),
    }
}

/// Query the OS for an external listener on `port`.
pub async fn external_listener(port: u16) -> Option<ExternalListener> {
    let mut command = Command::new("ss");
    command
        .args(["-tlnp", &format!("sport = :{port}")])
        .stdin(Stdio::null());

    let result = tokio::time::timeout(SS_TIMEOUT, command.output()).await;
    let output = match result {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(_)) => return None,
        Ok(Err(e)) => {
            warn!("Failed to check port with ss: {e}");
            return None;
        }
        Err(_) => {
            warn!("ss timed out checking port {port}");
            return None;
        }
    };

    parse_ss_output(&String::from_utf8_lossy(&output.stdout))
}

/// Full conflict check: boxctl forwards first, then external listeners.
/// Returns `{available, used_by}`.
pub async fn check_port(tunnel: &TunnelServer, port: u16) -> Value {
    if let Some((container, direction)) = tunnel.find_forward(port) {
        return json!({
            "available": false,
            "used_by": {
                "type": "boxctl",
                "container": container,
                "direction": direction,
            },
        });
    }

    if let Some(listener) = external_listener(port).await {
        return json!({
            "available": false,
            "used_by": {
                "type": "external",
                "process": listener.process,
                "pid": listener.pid,
            },
        });
    }

    json!({"available": true, "used_by": null})
}

/// Pre-check before adding a host port: refuse ports already published by an
/// engine-managed container.
pub async fn docker_port_conflict(docker: &DockerService, port: u16) -> Option<String> {
    match docker.port_bound_by(port).await {
        Ok(owner) => owner,
        Err(e) => {
            warn!("Docker port check failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ss_with_process() {
        let output = "State  Recv-Q Send-Q Local Address:Port Peer Address:Port Process\n\
                      LISTEN 0      4096   127.0.0.1:5432    0.0.0.0:*         users:((\"postgres\",pid=1234,fd=7))\n";
        let listener = parse_ss_output(output).unwrap();
        assert_eq!(listener.process, "postgres");
        assert_eq!(listener.pid, Some(1234));
    }

    #[test]
    fn test_parse_ss_without_process_info() {
        let output = "State  Recv-Q Send-Q Local Address:Port Peer Address:Port Process\n\
                      LISTEN 0      4096   127.0.0.1:5432    0.0.0.0:*\n";
        let listener = parse_ss_output(output).unwrap();
        assert_eq!(listener.process, "unknown");
        assert_eq!(listener.pid, None);
    }

    #[test]
    fn test_parse_ss_header_only_means_free() {
        let output = "State  Recv-Q Send-Q Local Address:Port Peer Address:Port Process\n";
        assert!(parse_ss_output(output).is_none());
        assert!(parse_ss_output("").is_none());
    }
}
