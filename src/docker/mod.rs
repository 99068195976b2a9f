//! Container runtime adapter and readiness polling.

mod ready;
mod service;

pub use ready::{wait_for_container_ready, InitProbe, ReadyStatus};
pub use service::{DockerService, BASE_IMAGE_TAG};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Label recording the project directory a container was created from.
pub const PROJECT_DIR_LABEL: &str = "boxctl.project_dir";

/// Label recording the sanitized project name.
pub const PROJECT_LABEL: &str = "boxctl.project";

/// Snapshot of a container as reported by the engine.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub status: String,
    pub labels: HashMap<String, String>,
}

/// Engine-reported health of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// No healthcheck configured
    None,
    Starting,
    Healthy,
    Unhealthy,
}

/// Init phase symbols written by the in-container init script to
/// `/tmp/boxctl-init-phase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitPhase {
    Starting,
    User,
    Ssh,
    McpPackages,
    ProjectPackages,
    McpServers,
    ContainerClient,
    Ready,
    Unknown,
}

impl InitPhase {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "starting" => InitPhase::Starting,
            "user" => InitPhase::User,
            "ssh" => InitPhase::Ssh,
            "mcp_packages" => InitPhase::McpPackages,
            "project_packages" => InitPhase::ProjectPackages,
            "mcp_servers" => InitPhase::McpServers,
            "container_client" => InitPhase::ContainerClient,
            "ready" => InitPhase::Ready,
            _ => InitPhase::Unknown,
        }
    }

    /// Human description shown while waiting for the container.
    pub fn description(&self) -> &'static str {
        match self {
            InitPhase::Starting => "Starting container",
            InitPhase::User => "Creating user",
            InitPhase::Ssh => "Configuring SSH",
            InitPhase::McpPackages => "Installing MCP dependencies",
            InitPhase::ProjectPackages => "Installing project packages",
            InitPhase::McpServers => "Starting MCP servers",
            InitPhase::ContainerClient => "Starting container client",
            InitPhase::Ready => "Ready",
            InitPhase::Unknown => "Initializing",
        }
    }
}

/// Per-item install progress from `/tmp/install-progress.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallProgress {
    #[serde(default)]
    pub items: Vec<InstallItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallItem {
    pub name: String,

    #[serde(default, rename = "type")]
    pub item_type: String,

    /// `pending` | `installing` | `done` | `failed`
    #[serde(default)]
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_parse_round_trip() {
        for (text, phase) in [
            ("starting", InitPhase::Starting),
            ("mcp_packages", InitPhase::McpPackages),
            ("ready\n", InitPhase::Ready),
            ("bogus", InitPhase::Unknown),
            ("", InitPhase::Unknown),
        ] {
            assert_eq!(InitPhase::parse(text), phase);
        }
    }

    #[test]
    fn test_install_progress_parse() {
        let progress: InstallProgress = serde_json::from_str(
            r#"{"items":[{"name":"ripgrep","type":"apt","status":"done"},
                         {"name":"requests","type":"pip","status":"installing"}]}"#,
        )
        .unwrap();
        assert_eq!(progress.items.len(), 2);
        assert_eq!(progress.items[0].item_type, "apt");
        assert_eq!(progress.items[1].status, "installing");
    }
}
