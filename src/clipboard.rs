//! Host clipboard integration.
//!
//! Tries `wl-copy` (Wayland), then `xclip`, then `xsel`. The tool is left to
//! daemonize on its own; the daemon only waits briefly for it to consume the
//! data.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

use crate::error::{DaemonError, Result};

/// Set a clipboard selection (`primary` or `clipboard`).
pub async fn set(data: &str, selection: &str) -> Result<()> {
    if data.is_empty() {
        return Err(DaemonError::InvalidPayload("empty_data".into()));
    }

    let candidates: Vec<Vec<&str>> = vec![
        if selection == "primary" {
            vec!["wl-copy", "--primary"]
        } else {
            vec!["wl-copy"]
        },
        vec!["xclip", "-selection", selection],
        if selection == "primary" {
            vec!["xsel", "--primary", "--input"]
        } else {
            vec!["xsel", "--clipboard", "--input"]
        },
    ];

    for argv in candidates {
        match try_tool(&argv, data).await {
            Ok(()) => return Ok(()),
            Err(DaemonError::ToolUnavailable(_)) => continue,
            Err(e) => return Err(e),
        }
    }

    warn!("No clipboard tool found (wl-copy, xclip, xsel)");
    Err(DaemonError::ToolUnavailable("wl-copy, xclip, or xsel".into()))
}

async fn try_tool(argv: &[&str], data: &str) -> Result<()> {
    let mut child = Command::new(argv[0])
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DaemonError::ToolUnavailable(argv[0].into()),
            _ => DaemonError::Io(e),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(data.as_bytes()).await?;
        // Dropping stdin closes the pipe; wl-copy then forks to background.
    }

    // Still running after the grace period means the tool daemonized, which
    // counts as success.
    let _ = tokio::time::timeout(Duration::from_millis(500), child.wait()).await;
    Ok(())
}
