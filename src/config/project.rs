//! Per-project configuration from `<project>/.boxctl/config.yml`.
//!
//! The model normalizes deprecated shapes on read (the legacy ports list)
//! while saving back whatever shape the file already used. Saves are atomic:
//! write to a temp file in the same directory, then rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DaemonError, Result};

/// Package names must be safe to hand to a shell inside the container.
/// Allows npm scopes, extras like `[dev]`, and version specifiers.
fn package_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?:@[a-zA-Z0-9_-]+/)?[a-zA-Z0-9][a-zA-Z0-9._+-]*(?:\[[a-zA-Z0-9,_-]+\])?(?:[@=<>~!][a-zA-Z0-9._,<>=~!*+-]+)?$",
        )
        .expect("package pattern is valid")
    })
}

/// Check a single package entry against the safe-name pattern.
pub fn is_valid_package_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 200 && package_pattern().is_match(name)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// `none` | `keys` | `mount` | `config`
    #[serde(default = "default_ssh_mode")]
    pub mode: String,

    /// Forward the host's SSH agent socket (`SSH_AUTH_SOCK`) into the
    /// container. Required with `mode: config` since no keys are copied.
    #[serde(default)]
    pub forward_agent: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: default_ssh_mode(),
            forward_agent: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_ssh_mode() -> String {
    "keys".into()
}

/// Additional host directory exposed under the container's context prefix.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkspaceMount {
    pub path: PathBuf,

    /// Mount point name; defaults to the directory basename
    #[serde(default)]
    pub mount: Option<String>,

    /// `ro` | `rw`
    #[serde(default = "default_mount_mode")]
    pub mode: String,
}

fn default_mount_mode() -> String {
    "ro".into()
}

/// External container this container should be able to reach.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContainerConnection {
    pub name: String,

    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PackagesConfig {
    #[serde(default)]
    pub apt: Vec<String>,
    #[serde(default)]
    pub pip: Vec<String>,
    #[serde(default)]
    pub npm: Vec<String>,
    #[serde(default)]
    pub cargo: Vec<String>,

    /// Arbitrary shell commands run after package installs
    #[serde(default)]
    pub post: Vec<String>,
}

impl PackagesConfig {
    fn invalid_entries(&self) -> Vec<String> {
        self.apt
            .iter()
            .chain(&self.pip)
            .chain(&self.npm)
            .chain(&self.cargo)
            .filter(|p| !is_valid_package_name(p))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResourcesConfig {
    /// e.g. "4g"
    #[serde(default)]
    pub memory: Option<String>,

    /// e.g. 2.0
    #[serde(default)]
    pub cpus: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    #[serde(default = "default_seccomp")]
    pub seccomp: Option<String>,

    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            seccomp: default_seccomp(),
            capabilities: Vec::new(),
        }
    }
}

fn default_seccomp() -> Option<String> {
    Some("unconfined".into())
}

/// Normative ports record.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PortsConfig {
    /// `"HOST[:CONTAINER]"` specs exposed from the container to the host
    #[serde(default)]
    pub host: Vec<String>,

    /// Host ports forwarded into the container
    #[serde(default)]
    pub container: Vec<String>,

    /// `tunnel` | `docker` | `auto`
    #[serde(default = "default_ports_mode")]
    pub mode: String,
}

fn default_ports_mode() -> String {
    "tunnel".into()
}

/// On-disk ports shape. The legacy form is a plain sequence of
/// `"HOST[:CONTAINER]"` strings; saves keep whichever shape was loaded.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PortsShape {
    Legacy(Vec<String>),
    Record(PortsConfig),
}

impl Default for PortsShape {
    fn default() -> Self {
        PortsShape::Record(PortsConfig::default())
    }
}

impl PortsShape {
    /// Normalize to the record form.
    pub fn normalized(&self) -> PortsConfig {
        match self {
            PortsShape::Record(config) => config.clone(),
            PortsShape::Legacy(list) => PortsConfig {
                host: list.clone(),
                container: Vec::new(),
                mode: default_ports_mode(),
            },
        }
    }
}

/// Parse a `"HOST[:CONTAINER]"` port spec.
pub fn parse_port_spec(spec: &str) -> Option<(u16, u16)> {
    match spec.split_once(':') {
        Some((host, container)) => {
            Some((host.trim().parse().ok()?, container.trim().parse().ok()?))
        }
        None => {
            let port = spec.trim().parse().ok()?;
            Some((port, port))
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskAgentsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_task_agent")]
    pub agent: String,

    /// Model alias: `fast` | `balanced` | `powerful`, or an agent-specific name
    #[serde(default = "default_task_model")]
    pub model: String,

    #[serde(default = "default_task_timeout")]
    pub timeout: u64,

    #[serde(default = "default_buffer_lines")]
    pub buffer_lines: u32,

    #[serde(default = "default_true")]
    pub enhance_hooks: bool,

    #[serde(default = "default_true")]
    pub enhance_stall: bool,

    #[serde(default)]
    pub prompt_template: Option<String>,
}

impl Default for TaskAgentsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            agent: default_task_agent(),
            model: default_task_model(),
            timeout: default_task_timeout(),
            buffer_lines: default_buffer_lines(),
            enhance_hooks: true,
            enhance_stall: true,
            prompt_template: None,
        }
    }
}

fn default_task_agent() -> String {
    "claude".into()
}

fn default_task_model() -> String {
    "fast".into()
}

fn default_task_timeout() -> u64 {
    30
}

fn default_buffer_lines() -> u32 {
    50
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StallDetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_stall_threshold")]
    pub threshold_seconds: f64,
}

impl Default for StallDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_seconds: default_stall_threshold(),
        }
    }
}

fn default_stall_threshold() -> f64 {
    30.0
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DockerAccessConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// CLI credential mounts. Off by default; users opt in per tool.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CredentialsConfig {
    /// Mount ~/.config/gh (GitHub CLI)
    #[serde(default)]
    pub gh: bool,

    /// Mount ~/.config/glab-cli (GitLab CLI)
    #[serde(default)]
    pub glab: bool,
}

/// Typed model of `.boxctl/config.yml`. Unknown fields are preserved so
/// newer writers do not lose data through older daemons.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectConfigModel {
    #[serde(default = "default_version")]
    pub version: String,

    /// Version of the last writer; used to warn on stale configs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boxctl_version: Option<String>,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub workspaces: Vec<WorkspaceMount>,

    #[serde(default)]
    pub containers: Vec<ContainerConnection>,

    #[serde(default)]
    pub system_packages: Vec<String>,

    #[serde(default)]
    pub packages: PackagesConfig,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default)]
    pub resources: ResourcesConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub devices: Vec<String>,

    #[serde(default)]
    pub ports: PortsShape,

    #[serde(default)]
    pub task_agents: TaskAgentsConfig,

    #[serde(default)]
    pub stall_detection: StallDetectionConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerAccessConfig>,

    #[serde(default)]
    pub credentials: CredentialsConfig,

    #[serde(default)]
    pub mcp_servers: Vec<String>,

    #[serde(default)]
    pub skills: Vec<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for ProjectConfigModel {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty mapping parses to defaults")
    }
}

fn default_version() -> String {
    "1.0".into()
}

impl ProjectConfigModel {
    /// Collect every package entry that fails the safe-name pattern.
    pub fn invalid_packages(&self) -> Vec<String> {
        let mut invalid: Vec<String> = self
            .system_packages
            .iter()
            .filter(|p| !is_valid_package_name(p))
            .cloned()
            .collect();
        invalid.extend(self.packages.invalid_entries());
        invalid
    }

    /// Workspace mounts whose host path does not exist. These are reported
    /// but may be skipped interactively at container start.
    pub fn missing_workspaces(&self) -> Vec<&WorkspaceMount> {
        self.workspaces.iter().filter(|w| !w.path.exists()).collect()
    }

    /// Normalized ports record regardless of the on-disk shape.
    pub fn ports_config(&self) -> PortsConfig {
        self.ports.normalized()
    }
}

/// Project directory for the current invocation, when the CLI exported it.
pub fn project_dir_from_env() -> Option<PathBuf> {
    std::env::var("BOXCTL_PROJECT_DIR").ok().map(PathBuf::from)
}

/// Handle to a project's config file.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    project_dir: PathBuf,
    pub model: ProjectConfigModel,
}

impl ProjectConfig {
    pub fn config_path(project_dir: &Path) -> PathBuf {
        project_dir.join(".boxctl").join("config.yml")
    }

    /// Load the project config, or defaults when the file is absent.
    /// Parse and validation failures fall back to defaults with a warning.
    pub fn load(project_dir: &Path) -> Self {
        let path = Self::config_path(project_dir);
        let model = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_yaml::from_str::<ProjectConfigModel>(&content) {
                Ok(model) => {
                    let invalid = model.invalid_packages();
                    if invalid.is_empty() {
                        model
                    } else {
                        tracing::warn!(
                            "{}: invalid package entries {invalid:?}; using defaults",
                            path.display()
                        );
                        ProjectConfigModel::default()
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}; using defaults", path.display());
                    ProjectConfigModel::default()
                }
            },
            Err(_) => ProjectConfigModel::default(),
        };

        Self {
            project_dir: project_dir.to_path_buf(),
            model,
        }
    }

    pub fn exists(&self) -> bool {
        Self::config_path(&self.project_dir).exists()
    }

    /// Persist atomically: write a temp file alongside, then rename over.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path(&self.project_dir);
        let parent = path
            .parent()
            .ok_or_else(|| DaemonError::Config("config path has no parent".into()))?;
        std::fs::create_dir_all(parent)?;

        let content = serde_yaml::to_string(&self.model)
            .map_err(|e| DaemonError::Config(format!("serialize config: {e}")))?;

        let tmp = parent.join(".config.yml.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_name_validation() {
        for valid in [
            "requests",
            "requests==2.31.0",
            "@scope/pkg",
            "@scope/pkg@1.2.3",
            "pkg[dev,test]",
            "libssl-dev",
            "serde_json",
        ] {
            assert!(is_valid_package_name(valid), "{valid} should be valid");
        }
        for invalid in ["", "pkg; rm -rf /", "pkg && echo", "$(whoami)", "pkg=="] {
            assert!(!is_valid_package_name(invalid), "{invalid} should be invalid");
        }
    }

    #[test]
    fn test_legacy_ports_normalize() {
        let model: ProjectConfigModel =
            serde_yaml::from_str("ports:\n  - \"8080\"\n  - \"5432:5433\"\n").unwrap();
        assert!(matches!(model.ports, PortsShape::Legacy(_)));

        let ports = model.ports_config();
        assert_eq!(ports.host, vec!["8080", "5432:5433"]);
        assert!(ports.container.is_empty());
        assert_eq!(ports.mode, "tunnel");
    }

    #[test]
    fn test_record_ports_parse() {
        let model: ProjectConfigModel = serde_yaml::from_str(
            "ports:\n  host: [\"3000\"]\n  container: [\"5432\"]\n  mode: docker\n",
        )
        .unwrap();
        let ports = model.ports_config();
        assert_eq!(ports.mode, "docker");
        assert_eq!(ports.container, vec!["5432"]);
    }

    #[test]
    fn test_legacy_shape_survives_save() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".boxctl")).unwrap();
        std::fs::write(
            ProjectConfig::config_path(dir.path()),
            "ports:\n  - \"8080\"\n",
        )
        .unwrap();

        let config = ProjectConfig::load(dir.path());
        config.save().unwrap();

        let reloaded = ProjectConfig::load(dir.path());
        assert!(matches!(reloaded.model.ports, PortsShape::Legacy(_)));
    }

    #[test]
    fn test_parse_port_spec() {
        assert_eq!(parse_port_spec("8080"), Some((8080, 8080)));
        assert_eq!(parse_port_spec("5432:5433"), Some((5432, 5433)));
        assert_eq!(parse_port_spec("nope"), None);
        assert_eq!(parse_port_spec("70000"), None);
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let model: ProjectConfigModel =
            serde_yaml::from_str("version: \"1.0\"\nfuture_feature:\n  knob: 3\n").unwrap();
        assert!(model.extra.contains_key("future_feature"));

        let out = serde_yaml::to_string(&model).unwrap();
        assert!(out.contains("future_feature"));
    }

    #[test]
    fn test_invalid_packages_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".boxctl")).unwrap();
        std::fs::write(
            ProjectConfig::config_path(dir.path()),
            "packages:\n  pip:\n    - \"pkg; rm -rf /\"\n",
        )
        .unwrap();

        let config = ProjectConfig::load(dir.path());
        assert!(config.model.packages.pip.is_empty());
    }

    #[test]
    fn test_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProjectConfig::load(dir.path());
        assert_eq!(config.model.version, "1.0");
        assert!(config.model.ssh.enabled);
        assert_eq!(config.model.ssh.mode, "keys");
        assert!(!config.exists());
    }
}
