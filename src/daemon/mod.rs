//! The host daemon.
//!
//! Owns the shared state tables, the SSH tunnel server, the CLI RPC socket,
//! notification dispatch, and the background monitors. Everything a CLI or a
//! container can ask for goes through here.

pub mod actions;
pub mod listener;
pub mod ssh_handlers;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::HostConfig;
use crate::docker::DockerService;
use crate::notify::Notifier;
use crate::tailscale::TailscaleMonitor;
use crate::tunnel::{ServerConfig, TunnelServer};

use state::DaemonState;

pub struct Daemon {
    pub config: HostConfig,
    pub state: Arc<DaemonState>,
    pub tunnel: Arc<TunnelServer>,

    /// Engine access; `None` when the Docker socket is unreachable. Handlers
    /// that need it degrade instead of failing the daemon.
    pub docker: Option<Arc<DockerService>>,

    pub notifier: Notifier,
}

impl Daemon {
    pub fn new(config: HostConfig, bind_rx: watch::Receiver<Vec<String>>) -> Arc<Self> {
        let tunnel = TunnelServer::new(
            ServerConfig {
                socket_path: config.ssh_socket_path(),
                host_key_path: config.runtime_dir().join("ssh_host_key"),
            },
            bind_rx,
        );

        let docker = match DockerService::new() {
            Ok(service) => Some(Arc::new(service)),
            Err(e) => {
                warn!("Docker engine unavailable: {e}");
                None
            }
        };

        let notifier = Notifier::new(config.notifications.clone(), config.notify_hook.clone());

        Arc::new(Self {
            state: DaemonState::new(),
            tunnel,
            docker,
            notifier,
            config,
        })
    }

    /// Deadline for synchronous host-to-container requests.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.config.timeouts.request)
    }

    /// Inject keys into a container session's terminal (used by the web
    /// layer).
    pub async fn send_input(
        &self,
        container: &str,
        session: &str,
        keys: &str,
        literal: bool,
    ) -> bool {
        self.tunnel
            .send_to_container(
                container,
                "stream_input",
                json!({"session": session, "keys": keys, "literal": literal}),
            )
            .await
            .is_ok()
    }

    /// Tunnel statistics for the status view.
    pub fn tunnel_stats(&self) -> Value {
        let (connected, forwards) = self.tunnel.stats();
        json!({
            "ssh_tunnel": {
                "connected_containers": connected,
                "total_forwards": forwards,
            }
        })
    }
}

/// Run the daemon until ctrl-c.
pub async fn run(config: HostConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // The bind-address set starts without a tailscale IP; the monitor
    // refreshes it as soon as one is observed.
    let (bind_tx, bind_rx) = watch::channel(config.bind_addresses(None));

    let daemon = Daemon::new(config, bind_rx);
    ssh_handlers::register_all(&daemon);

    let tailscale = if daemon.config.uses_tailscale() && daemon.config.tailscale_monitor.enabled {
        let monitor = TailscaleMonitor::start(
            Duration::from_secs_f64(daemon.config.tailscale_monitor.check_interval_seconds),
            cancel.clone(),
        )
        .await;

        // Seed the bind set with the IP observed at startup, then follow
        // every change.
        let _ = bind_tx.send(daemon.config.bind_addresses(monitor.current().as_deref()));
        let mut ip_rx = monitor.subscribe();
        let follow_config = daemon.config.clone();
        let follow_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = follow_cancel.cancelled() => return,
                    changed = ip_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let ip = ip_rx.borrow().clone();
                        let _ = bind_tx.send(follow_config.bind_addresses(ip.as_deref()));
                    }
                }
            }
        });
        Some(monitor)
    } else {
        None
    };

    daemon
        .tunnel
        .start()
        .context("failed to start SSH tunnel server")?;

    if daemon.config.web_server.enabled {
        crate::web::spawn(
            daemon.clone(),
            tailscale.as_ref().map(|m| m.subscribe()),
            cancel.clone(),
        );
    }

    let listener = listener::CliListener::bind(&daemon.config)
        .context("failed to bind CLI socket")?;

    info!("boxctld ready");

    tokio::select! {
        result = listener.run(daemon.clone(), cancel.clone()) => {
            result.context("CLI listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    // Stop accepting first and give in-flight tasks a moment to wind down
    // before the tunnel goes away underneath them.
    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(250)).await;
    daemon.tunnel.stop().await;
    let _ = std::fs::remove_file(daemon.config.socket_path());
    Ok(())
}
