//! Host-side configuration from `~/.config/boxctl/config.yml`.
//!
//! Loaded once at daemon start. A file that fails to parse falls back to
//! defaults with a warning; it never aborts startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Main host configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HostConfig {
    /// Install-root overrides
    #[serde(default)]
    pub paths: PathsConfig,

    /// Status web server
    #[serde(default)]
    pub web_server: WebServerConfig,

    /// Port listener bind addresses
    #[serde(default)]
    pub network: NetworkConfig,

    /// Notification channels and policy
    #[serde(default)]
    pub notifications: NotificationsConfig,

    /// Operation timeouts
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Tailscale IP monitor
    #[serde(default)]
    pub tailscale_monitor: TailscaleMonitorConfig,

    /// Optional user hook run for every notification: `hook title summary urgency`
    #[serde(default)]
    pub notify_hook: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PathsConfig {
    /// Override for the boxctl install root (library, images, etc.)
    #[serde(default)]
    pub boxctl_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Single host to bind, used when `hosts` is empty
    #[serde(default = "default_web_host")]
    pub host: String,

    /// Hosts to bind; the literal `"tailscale"` resolves at runtime
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default = "default_web_port")]
    pub port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_web_host(),
            hosts: Vec::new(),
            port: default_web_port(),
            log_level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_web_host() -> String {
    "127.0.0.1".into()
}

fn default_web_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Addresses remote-forward listeners bind on; `"tailscale"` resolves
    /// at runtime
    #[serde(default = "default_bind_addresses")]
    pub bind_addresses: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addresses: default_bind_addresses(),
        }
    }
}

fn default_bind_addresses() -> Vec<String> {
    vec!["127.0.0.1".into(), "tailscale".into()]
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,

    /// Dismiss desktop/Telegram notifications when the session resumes
    #[serde(default = "default_true")]
    pub auto_dismiss: bool,

    /// Desktop notification timeout in seconds
    #[serde(default = "default_notify_timeout")]
    pub timeout: u64,

    /// Timeout for enhanced (agent-summarized) notifications
    #[serde(default = "default_notify_timeout_enhanced")]
    pub timeout_enhanced: u64,

    /// Window in milliseconds inside which repeat notifications for the
    /// same (container, session) are coalesced
    #[serde(default = "default_dedup_window_ms")]
    pub deduplication_window: u64,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            telegram: None,
            auto_dismiss: true,
            timeout: default_notify_timeout(),
            timeout_enhanced: default_notify_timeout_enhanced(),
            deduplication_window: default_dedup_window_ms(),
        }
    }
}

fn default_notify_timeout() -> u64 {
    10
}

fn default_notify_timeout_enhanced() -> u64 {
    30
}

fn default_dedup_window_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub bot_token: String,

    #[serde(default)]
    pub chat_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutsConfig {
    /// Seconds to wait for a container to become healthy
    #[serde(default = "default_container_wait")]
    pub container_wait: f64,

    /// Deadline in seconds for synchronous host-to-container requests
    #[serde(default = "default_request_timeout")]
    pub request: f64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            container_wait: default_container_wait(),
            request: default_request_timeout(),
        }
    }
}

fn default_container_wait() -> f64 {
    90.0
}

fn default_request_timeout() -> f64 {
    10.0
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TailscaleMonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: f64,
}

impl Default for TailscaleMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_seconds: default_check_interval(),
        }
    }
}

fn default_check_interval() -> f64 {
    30.0
}

impl HostConfig {
    /// Default config file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("boxctl")
            .join("config.yml")
    }

    /// Load from the default location.
    pub fn load() -> Self {
        Self::load_from(&Self::default_path())
    }

    /// Load from an explicit path. Missing or invalid files fall back to
    /// defaults; startup is never aborted by a bad config.
    pub fn load_from(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return Self::default(),
        };

        match serde_yaml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to parse {}: {e}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// boxctl install root: config override, then `BOXCTL_DIR`, then the
    /// platform data directory.
    pub fn boxctl_dir(&self) -> PathBuf {
        if let Some(dir) = &self.paths.boxctl_dir {
            return dir.clone();
        }
        if let Ok(dir) = std::env::var("BOXCTL_DIR") {
            return PathBuf::from(dir);
        }
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("boxctl")
    }

    /// Per-user runtime directory holding the daemon sockets.
    pub fn runtime_dir(&self) -> PathBuf {
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("boxctl")
    }

    /// CLI RPC socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir().join("boxctld.sock")
    }

    /// SSH tunnel socket path; `BOXCTL_SSH_SOCKET` overrides.
    pub fn ssh_socket_path(&self) -> PathBuf {
        if let Ok(path) = std::env::var("BOXCTL_SSH_SOCKET") {
            return PathBuf::from(path);
        }
        self.runtime_dir().join("ssh.sock")
    }

    /// Whether `"tailscale"` appears in web hosts or bind addresses.
    pub fn uses_tailscale(&self) -> bool {
        self.web_server
            .hosts
            .iter()
            .chain(self.network.bind_addresses.iter())
            .any(|h| h.eq_ignore_ascii_case("tailscale"))
    }

    /// Hosts to bind the web server on, with `"tailscale"` resolved to the
    /// monitor's current IP. Falls back to the single `host` field when the
    /// `hosts` list is empty.
    pub fn web_server_hosts(&self, tailscale_ip: Option<&str>) -> Vec<String> {
        if self.web_server.hosts.is_empty() {
            return vec![self.web_server.host.clone()];
        }
        let resolved = resolve_hosts(&self.web_server.hosts, tailscale_ip);
        if resolved.is_empty() {
            vec!["127.0.0.1".into()]
        } else {
            resolved
        }
    }

    /// Addresses to bind remote-forward listeners on, with `"tailscale"`
    /// resolved. Never empty.
    pub fn bind_addresses(&self, tailscale_ip: Option<&str>) -> Vec<String> {
        let resolved = resolve_hosts(&self.network.bind_addresses, tailscale_ip);
        if resolved.is_empty() {
            vec!["127.0.0.1".into()]
        } else {
            resolved
        }
    }
}

fn resolve_hosts(hosts: &[String], tailscale_ip: Option<&str>) -> Vec<String> {
    let mut resolved = Vec::with_capacity(hosts.len());
    for host in hosts {
        if host.eq_ignore_ascii_case("tailscale") {
            if let Some(ip) = tailscale_ip {
                resolved.push(ip.to_string());
            }
            // Unavailable tailscale IPs are skipped; the monitor rebinds
            // when one appears.
        } else {
            resolved.push(host.clone());
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert!(config.web_server.enabled);
        assert_eq!(config.web_server.port, 8080);
        assert_eq!(
            config.network.bind_addresses,
            vec!["127.0.0.1".to_string(), "tailscale".to_string()]
        );
        assert!(config.notifications.auto_dismiss);
        assert_eq!(config.timeouts.request, 10.0);
    }

    #[test]
    fn test_partial_yaml_merges_with_defaults() {
        let config: HostConfig = serde_yaml::from_str(
            "web_server:\n  port: 9999\nnotifications:\n  deduplication_window: 250\n",
        )
        .unwrap();
        assert_eq!(config.web_server.port, 9999);
        assert_eq!(config.web_server.host, "127.0.0.1");
        assert_eq!(config.notifications.deduplication_window, 250);
        assert!(config.tailscale_monitor.enabled);
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "web_server: [not, a, mapping]").unwrap();
        let config = HostConfig::load_from(&path);
        assert_eq!(config.web_server.port, 8080);
    }

    #[test]
    fn test_uses_tailscale() {
        let mut config = HostConfig::default();
        assert!(config.uses_tailscale());
        config.network.bind_addresses = vec!["127.0.0.1".into()];
        assert!(!config.uses_tailscale());
        config.web_server.hosts = vec!["Tailscale".into()];
        assert!(config.uses_tailscale());
    }

    #[test]
    fn test_bind_address_resolution() {
        let config = HostConfig::default();
        assert_eq!(
            config.bind_addresses(Some("100.64.0.7")),
            vec!["127.0.0.1".to_string(), "100.64.0.7".to_string()]
        );
        assert_eq!(config.bind_addresses(None), vec!["127.0.0.1".to_string()]);
    }

    #[test]
    fn test_bind_addresses_never_empty() {
        let mut config = HostConfig::default();
        config.network.bind_addresses = vec!["tailscale".into()];
        assert_eq!(config.bind_addresses(None), vec!["127.0.0.1".to_string()]);
    }

    #[test]
    fn test_web_hosts_fall_back_to_single_host() {
        let mut config = HostConfig::default();
        config.web_server.host = "0.0.0.0".into();
        assert_eq!(config.web_server_hosts(None), vec!["0.0.0.0".to_string()]);
        config.web_server.hosts = vec!["127.0.0.1".into(), "tailscale".into()];
        assert_eq!(
            config.web_server_hosts(Some("100.64.0.7")),
            vec!["127.0.0.1".to_string(), "100.64.0.7".to_string()]
        );
    }
}
