//! Desktop notifications via the freedesktop tools.
//!
//! `notify-send -p` returns the notification id, which lets a later
//! `session_resumed` dismiss the bubble through gdbus.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{DaemonError, Result};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);
const DISMISS_TIMEOUT: Duration = Duration::from_secs(5);

const BELL_SOUND: &str = "/usr/share/sounds/freedesktop/stereo/bell.oga";

/// Send a desktop notification; returns the notification id (0 when the
/// installed notify-send predates `-p` support).
pub async fn send(title: &str, message: &str, urgency: &str) -> Result<u32> {
    let mut command = Command::new("notify-send");
    command
        .args(["-p", "-u", urgency, title, message])
        .stdin(Stdio::null());

    let output = tokio::time::timeout(NOTIFY_TIMEOUT, command.output())
        .await
        .map_err(|_| DaemonError::Timeout)?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DaemonError::ToolUnavailable("notify-send".into()),
            _ => DaemonError::Io(e),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("notify-send failed: {}", stderr.trim());
        return Err(DaemonError::Internal("notify-send failed".into()));
    }

    let id = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .unwrap_or(0);
    Ok(id)
}

/// Dismiss a previously sent desktop notification.
pub async fn dismiss(notification_id: u32) -> bool {
    let id_arg = notification_id.to_string();
    let mut command = Command::new("gdbus");
    command
        .args([
            "call",
            "--session",
            "--dest",
            "org.freedesktop.Notifications",
            "--object-path",
            "/org/freedesktop/Notifications",
            "--method",
            "org.freedesktop.Notifications.CloseNotification",
            id_arg.as_str(),
        ])
        .stdin(Stdio::null());

    let result = tokio::time::timeout(DISMISS_TIMEOUT, command.output()).await;
    match result {
        Ok(Ok(output)) if output.status.success() => {
            debug!("Dismissed desktop notification {notification_id}");
            true
        }
        Ok(Ok(_)) | Ok(Err(_)) => {
            debug!("Could not dismiss desktop notification {notification_id}");
            false
        }
        Err(_) => {
            debug!("Timeout dismissing notification {notification_id}");
            false
        }
    }
}

/// Audible bell for critical notifications. Best effort only.
pub async fn beep() {
    if std::path::Path::new(BELL_SOUND).exists() {
        let mut command = Command::new("paplay");
        command
            .arg(BELL_SOUND)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Ok(Ok(status)) = tokio::time::timeout(DISMISS_TIMEOUT, command.status()).await {
            if status.success() {
                return;
            }
        }
    }
    // Fall back to the terminal bell.
    let _ = std::fs::write("/dev/tty", b"\x07");
}
