//! Main daemon command.

use std::path::Path;

use anyhow::Result;
use tracing::info;

use boxctld::config::HostConfig;

/// Load the host config and run the daemon until interrupted.
pub async fn run(config_path: Option<&str>) -> Result<()> {
    let config = match config_path {
        Some(path) => {
            info!("Loading configuration from: {path}");
            HostConfig::load_from(Path::new(path))
        }
        None => HostConfig::load(),
    };

    info!("  CLI socket: {}", config.socket_path().display());
    info!("  SSH socket: {}", config.ssh_socket_path().display());
    if config.web_server.enabled {
        info!("  Web server port: {}", config.web_server.port);
    }

    boxctld::daemon::run(config).await
}
