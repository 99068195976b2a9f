//! Daemon error types and their wire representation.
//!
//! Every user-visible failure is rendered as `{ok: false, error: "<tag>",
//! hint?: "<help>"}`; human-readable messages are built at the CLI layer.

use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("Docker error: {0}")]
    Engine(#[from] bollard::errors::Error),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("container {0} not connected")]
    SshDisconnected(String),

    #[error("request timed out")]
    Timeout,

    #[error("port {port} already in use")]
    PortConflict { port: u16, used_by: Value },

    #[error("port not in allowlist")]
    NotAllowed,

    #[error("external tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("agent is rate limited")]
    RateLimited,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

impl DaemonError {
    /// Short machine-readable tag used in wire responses.
    pub fn tag(&self) -> &'static str {
        match self {
            DaemonError::InvalidPayload(_) => "invalid_payload",
            DaemonError::UnknownAction(_) => "unknown_action",
            DaemonError::UnknownType(_) => "unknown_type",
            DaemonError::MissingField(_) => "missing_field",
            DaemonError::Engine(_) | DaemonError::ContainerNotFound(_) => "engine_error",
            DaemonError::SshDisconnected(_) => "ssh_disconnected",
            DaemonError::Timeout => "timeout",
            DaemonError::PortConflict { .. } => "port_conflict",
            DaemonError::NotAllowed => "not_allowed",
            DaemonError::ToolUnavailable(_) => "external_tool_unavailable",
            DaemonError::RateLimited => "rate_limited",
            DaemonError::Io(_) | DaemonError::Config(_) | DaemonError::Internal(_) => "internal",
        }
    }

    /// Optional hint appended to the response for the CLI to display.
    pub fn hint(&self) -> Option<String> {
        match self {
            DaemonError::Engine(e) => Some(format!("docker: {e}")),
            DaemonError::ContainerNotFound(name) => {
                Some(format!("container {name} does not exist; run `boxctl up` first"))
            }
            DaemonError::SshDisconnected(name) => {
                Some(format!("{name} has no active control channel"))
            }
            DaemonError::MissingField(field) => Some(format!("field `{field}` is required")),
            DaemonError::ToolUnavailable(tool) => Some(format!("install {tool} on the host")),
            DaemonError::NotAllowed => Some("request the port with port_add first".to_string()),
            _ => None,
        }
    }

    /// Render as a `{ok:false, error, hint?}` response object.
    pub fn to_response(&self) -> Value {
        let mut resp = json!({"ok": false, "error": self.tag()});
        if let DaemonError::PortConflict { used_by, .. } = self {
            resp["used_by"] = used_by.clone();
        }
        if let Some(hint) = self.hint() {
            resp["hint"] = Value::String(hint);
        }
        resp
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_tags() {
        assert_eq!(DaemonError::Timeout.tag(), "timeout");
        assert_eq!(DaemonError::NotAllowed.tag(), "not_allowed");
        assert_eq!(
            DaemonError::UnknownAction("frobnicate".into()).tag(),
            "unknown_action"
        );
        assert_eq!(
            DaemonError::SshDisconnected("boxctl-x".into()).tag(),
            "ssh_disconnected"
        );
    }

    #[test]
    fn test_response_shape() {
        let resp = DaemonError::MissingField("container").to_response();
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["error"], "missing_field");
        assert!(resp["hint"].as_str().unwrap().contains("container"));
    }

    #[test]
    fn test_port_conflict_carries_owner() {
        let err = DaemonError::PortConflict {
            port: 5432,
            used_by: json!({"type": "boxctl", "container": "boxctl-y"}),
        };
        let resp = err.to_response();
        assert_eq!(resp["error"], "port_conflict");
        assert_eq!(resp["used_by"]["container"], "boxctl-y");
    }
}
