//! Tailscale IP monitor.
//!
//! Watches the node's mesh IPv4 address and publishes changes on a watch
//! channel so remote-forward listeners and the web server can rebind. A
//! missing or failing `tailscale` CLI reads as "no IP", which is a valid
//! steady state.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const CLI_TIMEOUT: Duration = Duration::from_secs(2);

/// Read the current Tailscale IPv4 address, if the CLI is available and the
/// node is up.
pub async fn current_ip() -> Option<String> {
    let mut command = Command::new("tailscale");
    command.args(["ip", "-4"]).stdin(Stdio::null());

    let output = tokio::time::timeout(CLI_TIMEOUT, command.output())
        .await
        .ok()?
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let ip = stdout.lines().next()?.trim();
    (!ip.is_empty()).then(|| ip.to_string())
}

/// Handle to the running monitor.
pub struct TailscaleMonitor {
    ip_rx: watch::Receiver<Option<String>>,
}

impl TailscaleMonitor {
    /// Start the background watcher. The receiver always carries the most
    /// recently observed IP (or `None`).
    pub async fn start(check_interval: Duration, cancel: CancellationToken) -> Self {
        let initial = current_ip().await;
        info!("Tailscale monitor started (current IP: {initial:?})");
        let (tx, ip_rx) = watch::channel(initial);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Tailscale monitor stopped");
                        return;
                    }
                    _ = interval.tick() => {}
                }

                let observed = current_ip().await;
                let changed = {
                    let current = tx.borrow();
                    *current != observed
                };
                if changed {
                    log_transition(tx.borrow().clone(), observed.clone());
                    if tx.send(observed).is_err() {
                        error!("Tailscale monitor: all receivers dropped");
                        return;
                    }
                }
            }
        });

        Self { ip_rx }
    }

    /// A receiver that resolves `changed()` whenever the IP moves.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.ip_rx.clone()
    }

    /// Most recently observed IP.
    pub fn current(&self) -> Option<String> {
        self.ip_rx.borrow().clone()
    }
}

fn log_transition(old: Option<String>, new: Option<String>) {
    match (old, new) {
        (None, Some(ip)) => info!("Tailscale IP now available: {ip}"),
        (Some(ip), None) => info!("Tailscale IP no longer available (was {ip})"),
        (Some(old), Some(new)) => info!("Tailscale IP changed: {old} -> {new}"),
        (None, None) => {}
    }
}
