//! CLI RPC socket.
//!
//! One newline-terminated JSON object per connection on a user-private unix
//! socket, one reply, then close. Receive is bounded (10 MiB) and both
//! directions carry a 5 s deadline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HostConfig;
use crate::error::Result;

use super::{actions, Daemon};

/// Per-connection receive budget.
const MAX_RECV_BUFFER: usize = 10 * 1024 * 1024;

/// Deadline for the request to arrive (first newline).
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for writing the reply.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct CliListener {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl CliListener {
    /// Bind the CLI socket, replacing any stale file, mode 0600.
    pub fn bind(config: &HostConfig) -> Result<Self> {
        let socket_path = config.socket_path();
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!("Listening on {}", socket_path.display());
        Ok(Self {
            listener,
            socket_path,
        })
    }

    /// Accept loop; each connection is handled on its own task.
    pub async fn run(self, daemon: Arc<Daemon>, cancel: CancellationToken) -> Result<()> {
        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = std::fs::remove_file(&self.socket_path);
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        error!("Connection error: {e}");
                        continue;
                    }
                },
            };

            let daemon = daemon.clone();
            tokio::spawn(async move {
                handle_connection(daemon, stream).await;
            });
        }
    }
}

async fn handle_connection(daemon: Arc<Daemon>, mut stream: UnixStream) {
    let Some(data) = read_request(&mut stream).await else {
        return;
    };
    if data.iter().all(|b| b.is_ascii_whitespace()) {
        return;
    }

    // Several newline-separated requests may arrive on one connection; each
    // is handled, the last response is sent back.
    let mut last_response = None;
    for line in data.split(|b| *b == b'\n') {
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        last_response = Some(handle_line(&daemon, line).await);
    }

    let response = last_response.unwrap_or_else(|| json!({"ok": false, "error": "empty_request"}));
    let mut reply = response.to_string();
    reply.push('\n');

    let send = async {
        stream.write_all(reply.as_bytes()).await?;
        stream.shutdown().await
    };
    match tokio::time::timeout(SEND_TIMEOUT, send).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Send failed: {e}"),
        Err(_) => warn!("Send timed out"),
    }
}

async fn handle_line(daemon: &Arc<Daemon>, line: &[u8]) -> Value {
    let request: Value = match serde_json::from_slice(line) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) => {
            warn!("Non-object CLI request");
            return json!({"ok": false, "error": "invalid_payload"});
        }
        Err(e) => {
            warn!("JSON parse error: {e}");
            return json!({"ok": false, "error": "invalid_json"});
        }
    };

    actions::handle_action(daemon, request).await
}

/// Read until the first newline within the deadline and budget. Returns
/// `None` when the request never completed; the connection is dropped
/// without a reply, matching a client that went away.
async fn read_request(stream: &mut UnixStream) -> Option<Vec<u8>> {
    let mut data = Vec::new();
    let mut chunk = [0u8; 4096];

    let read_all = async {
        loop {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return (!data.is_empty()).then_some(());
            }
            data.extend_from_slice(&chunk[..n]);
            if data.len() > MAX_RECV_BUFFER {
                warn!("CLI request exceeded {MAX_RECV_BUFFER} byte budget, dropping");
                return None;
            }
            if data.contains(&b'\n') {
                return Some(());
            }
        }
    };

    let result = tokio::time::timeout(READ_TIMEOUT, read_all).await;
    match result {
        Ok(Some(())) => {
            if !data.contains(&b'\n') {
                debug!("Connection closed without newline, got {} bytes", data.len());
            }
            Some(data)
        }
        Ok(None) => None,
        Err(_) => {
            warn!(
                "Connection timed out waiting for newline, got {} bytes",
                data.len()
            );
            None
        }
    }
}
