//! Per-container connection state.
//!
//! Each connected container owns one control channel, a writer task that
//! serializes outbound frames, a table of in-flight host-originated requests,
//! and the forward records plus their host-side listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DaemonError, Result};
use crate::wire::{Frame, FrameCodec};

use super::forwards::ForwardRecord;

/// Outbound frames queued per connection before the writer applies
/// back-pressure.
const OUTBOUND_QUEUE: usize = 256;

/// In-flight host-originated requests. Each slot resolves exactly once:
/// by a matching response, a timeout (caller reclaims the slot), or
/// connection teardown (all senders dropped).
pub(crate) struct PendingRequests {
    next_id: AtomicU64,
    slots: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a request id and its waiter.
    pub fn register(&self) -> (String, oneshot::Receiver<Value>) {
        let id = format!("r{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(id.clone(), tx);
        (id, rx)
    }

    /// Deliver a response; returns false when the slot is gone (timed out
    /// or never existed) and the response is discarded.
    pub fn resolve(&self, id: &str, value: Value) -> bool {
        match self.slots.lock().remove(id) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Reclaim a slot after a timeout.
    pub fn cancel(&self, id: &str) {
        self.slots.lock().remove(id);
    }

    /// Drop every waiter; receivers observe a closed-channel error.
    pub fn fail_all(&self) {
        self.slots.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Server-side state of one connected container.
pub struct ContainerConnection {
    pub name: String,
    handle: Handle,
    channel: ChannelId,
    outbound: mpsc::Sender<Frame>,
    pending: PendingRequests,

    /// Host-side listeners tunneling into the container.
    pub remote_forwards: Mutex<Vec<ForwardRecord>>,

    /// Container-side listeners terminating on the host (display only).
    pub local_forwards: Mutex<Vec<ForwardRecord>>,

    /// `port_add` metadata awaiting the SSH-level `tcpip_forward`:
    /// host_port -> (container_port, name).
    expected_remote: Mutex<HashMap<u16, (u16, String)>>,

    /// Accept-loop tasks per bound host port.
    listeners: Mutex<HashMap<u16, Vec<JoinHandle<()>>>>,

    closed: CancellationToken,
}

impl ContainerConnection {
    /// Create the connection state and start its writer task.
    pub fn new(name: String, handle: Handle, channel: ChannelId) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
        let closed = CancellationToken::new();

        let conn = Arc::new(Self {
            name,
            handle: handle.clone(),
            channel,
            outbound: tx,
            pending: PendingRequests::new(),
            remote_forwards: Mutex::new(Vec::new()),
            local_forwards: Mutex::new(Vec::new()),
            expected_remote: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            closed: closed.clone(),
        });

        let writer_name = conn.name.clone();
        tokio::spawn(async move {
            let mut codec = FrameCodec;
            loop {
                let frame = tokio::select! {
                    _ = closed.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };

                let mut buf = bytes::BytesMut::new();
                if let Err(e) = codec.encode(&frame, &mut buf) {
                    warn!("{writer_name}: dropping unencodable frame: {e}");
                    continue;
                }
                if handle.data(channel, CryptoVec::from(buf.to_vec())).await.is_err() {
                    debug!("{writer_name}: control channel write failed, stopping writer");
                    break;
                }
            }
        });

        conn
    }

    /// Send a request to the container and wait for its response.
    ///
    /// Exactly one of three things happens: the matching response arrives, the
    /// deadline passes (`Timeout`, slot reclaimed, any later response is
    /// discarded), or the connection closes (`SshDisconnected`).
    pub async fn request(
        &self,
        msg_type: &str,
        payload: Value,
        timeout: std::time::Duration,
    ) -> Result<Value> {
        let (id, rx) = self.pending.register();
        let frame = Frame::request(msg_type, id.clone(), payload);

        if self.outbound.send(frame).await.is_err() {
            self.pending.cancel(&id);
            return Err(DaemonError::SshDisconnected(self.name.clone()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(DaemonError::SshDisconnected(self.name.clone())),
            Err(_) => {
                self.pending.cancel(&id);
                Err(DaemonError::Timeout)
            }
        }
    }

    /// Send a one-way event frame to the container.
    pub async fn send_event(&self, msg_type: &str, payload: Value) -> Result<()> {
        let frame = Frame::event(msg_type, payload);
        self.outbound
            .send(frame)
            .await
            .map_err(|_| DaemonError::SshDisconnected(self.name.clone()))
    }

    /// Queue a response frame for a container-originated request.
    pub async fn send_response(&self, msg_type: &str, id: &str, payload: Value) {
        let frame = Frame::response(msg_type, id, payload);
        if self.outbound.send(frame).await.is_err() {
            debug!("{}: response dropped, connection closing", self.name);
        }
    }

    /// Deliver a response frame to its waiter. Late responses are discarded.
    pub fn resolve_response(&self, id: &str, payload: Value) {
        if !self.pending.resolve(id, payload) {
            debug!("{}: discarding response for unknown id {id}", self.name);
        }
    }

    /// Record `port_add` metadata for an upcoming remote forward.
    pub fn expect_remote(&self, host_port: u16, container_port: u16, name: &str) {
        self.expected_remote
            .lock()
            .insert(host_port, (container_port, name.to_string()));
    }

    /// Bind host-side listeners for a remote forward across the bind-address
    /// set and record it. Re-binding an already-forwarded port replaces its
    /// listeners.
    pub async fn bind_remote_forward(&self, addrs: &[String], host_port: u16) -> Result<()> {
        let (container_port, name) = self
            .expected_remote
            .lock()
            .get(&host_port)
            .cloned()
            .or_else(|| {
                // Re-binds reuse the metadata of the record being replaced.
                self.remote_forwards
                    .lock()
                    .iter()
                    .find(|r| r.host_port == host_port)
                    .map(|r| (r.container_port, r.name.clone()))
            })
            .unwrap_or((host_port, format!("dynamic-{host_port}")));

        let mut handles = Vec::new();
        let mut bound_hosts = Vec::new();

        for addr in addrs {
            let listener = match TcpListener::bind((addr.as_str(), host_port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("{}: bind {addr}:{host_port} failed: {e}", self.name);
                    continue;
                }
            };
            bound_hosts.push(addr.clone());
            handles.push(self.spawn_accept_loop(listener, host_port));
        }

        if handles.is_empty() {
            return Err(DaemonError::Internal(format!(
                "no bind address accepted port {host_port}"
            )));
        }

        debug!(
            "{}: remote forward {host_port} -> {container_port} on {bound_hosts:?}",
            self.name
        );

        if let Some(old) = self.listeners.lock().insert(host_port, handles) {
            for handle in old {
                handle.abort();
            }
        }

        let record = ForwardRecord::new(host_port, container_port, &bound_hosts[0], &name);
        let mut records = self.remote_forwards.lock();
        records.retain(|r| r.host_port != host_port);
        records.push(record);
        Ok(())
    }

    fn spawn_accept_loop(&self, listener: TcpListener, host_port: u16) -> JoinHandle<()> {
        let handle = self.handle.clone();
        let closed = self.closed.clone();
        let container = self.name.clone();

        tokio::spawn(async move {
            loop {
                let (mut stream, peer) = tokio::select! {
                    _ = closed.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("{container}: accept on {host_port} failed: {e}");
                            return;
                        }
                    },
                };

                let channel = match handle
                    .channel_open_forwarded_tcpip(
                        "127.0.0.1",
                        host_port as u32,
                        peer.ip().to_string(),
                        peer.port() as u32,
                    )
                    .await
                {
                    Ok(channel) => channel,
                    Err(e) => {
                        debug!("{container}: forwarded-tcpip open failed: {e:?}");
                        continue;
                    }
                };

                tokio::spawn(async move {
                    let mut channel_stream = channel.into_stream();
                    let _ = tokio::io::copy_bidirectional(&mut stream, &mut channel_stream).await;
                });
            }
        })
    }

    /// Tear down a remote forward's listeners and record.
    pub fn remove_remote_forward(&self, host_port: u16) {
        if let Some(handles) = self.listeners.lock().remove(&host_port) {
            for handle in handles {
                handle.abort();
            }
        }
        self.remote_forwards
            .lock()
            .retain(|r| r.host_port != host_port);
        self.expected_remote.lock().remove(&host_port);
    }

    /// Remove a forward record by direction without touching listeners the
    /// container tore down itself.
    pub fn prune_forward(&self, direction: &str, host_port: u16) {
        match direction {
            "remote" => self.remove_remote_forward(host_port),
            "local" => self
                .local_forwards
                .lock()
                .retain(|r| r.host_port != host_port),
            _ => {}
        }
    }

    /// Re-bind every remote forward against a new bind-address set. No
    /// request replay is needed from the container; the forward records are
    /// authoritative.
    pub async fn rebind_remote_forwards(&self, addrs: &[String]) {
        let ports: Vec<u16> = self
            .remote_forwards
            .lock()
            .iter()
            .map(|r| r.host_port)
            .collect();

        for host_port in ports {
            if let Some(handles) = self.listeners.lock().remove(&host_port) {
                for handle in handles {
                    handle.abort();
                }
            }
            if let Err(e) = self.bind_remote_forward(addrs, host_port).await {
                warn!("{}: rebind of {host_port} failed: {e}", self.name);
            }
        }
    }

    /// Total forwards in both directions, for stats.
    pub fn forward_count(&self) -> usize {
        self.remote_forwards.lock().len() + self.local_forwards.lock().len()
    }

    /// Tear the connection down: stop the writer and every listener, and
    /// wake all pending waiters with a disconnect error.
    pub fn close(&self) {
        self.closed.cancel();
        let mut listeners = self.listeners.lock();
        for (_, handles) in listeners.drain() {
            for handle in handles {
                handle.abort();
            }
        }
        drop(listeners);
        self.pending.fail_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_pending_resolves_exactly_once() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register();
        assert_eq!(pending.len(), 1);

        assert!(pending.resolve(&id, json!({"ok": true})));
        assert_eq!(pending.len(), 0);

        // A second response for the same id is discarded.
        assert!(!pending.resolve(&id, json!({"ok": false})));
        assert_eq!(assert_ok!(rx.await), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_cancelled_slot_discards_late_response() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register();

        pending.cancel(&id);
        assert_eq!(pending.len(), 0);
        assert!(!pending.resolve(&id, json!({})));
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_fail_all_wakes_waiters() {
        let pending = PendingRequests::new();
        let (_id_a, rx_a) = pending.register();
        let (_id_b, rx_b) = pending.register();

        pending.fail_all();
        assert!(rx_a.await.is_err());
        assert!(rx_b.await.is_err());
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_request_ids_are_monotonic() {
        let pending = PendingRequests::new();
        let (a, _rx_a) = pending.register();
        let (b, _rx_b) = pending.register();
        assert_ne!(a, b);
        assert!(a.starts_with('r') && b.starts_with('r'));
    }
}
