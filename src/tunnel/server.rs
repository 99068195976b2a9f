//! SSH tunnel server on the host's `ssh.sock`.
//!
//! Containers dial this unix socket as SSH clients. Authentication is
//! position-based: the socket lives in a user-scoped directory, so the peer
//! is trusted and the username is recorded as the container name. One
//! control channel per connection carries the framed JSON protocol; SSH
//! port-forwarding primitives carry the actual TCP forwards.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use russh_keys::key::KeyPair;
use serde_json::{json, Value};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DaemonError, Result};
use crate::wire::{Frame, FrameCodec, FrameKind};

use super::connection::ContainerConnection;
use super::forwards::AllowedPorts;
use super::{EventHandler, RequestHandler, EVENT_CONTAINER_CONNECT, EVENT_CONTAINER_DISCONNECT};

/// Subsystem name the container client requests for the control channel.
const CONTROL_SUBSYSTEM: &str = "boxctl-control";

/// Tunnel server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub host_key_path: PathBuf,
}

pub struct TunnelServer {
    config: ServerConfig,

    /// Live connections by container name.
    connections: DashMap<String, Arc<ContainerConnection>>,

    request_handlers: RwLock<HashMap<String, RequestHandler>>,
    event_handlers: RwLock<HashMap<String, EventHandler>>,

    allowed_ports: AllowedPorts,
    allowed_hosts: HashSet<String>,

    /// Current bind-address set; updated by the tailscale monitor.
    bind_addresses: tokio::sync::watch::Receiver<Vec<String>>,

    cancel: CancellationToken,
}

impl TunnelServer {
    pub fn new(
        config: ServerConfig,
        bind_addresses: tokio::sync::watch::Receiver<Vec<String>>,
    ) -> Arc<Self> {
        let allowed_hosts: HashSet<String> = ["127.0.0.1", "localhost", "::1"]
            .into_iter()
            .map(String::from)
            .collect();

        Arc::new(Self {
            config,
            connections: DashMap::new(),
            request_handlers: RwLock::new(HashMap::new()),
            event_handlers: RwLock::new(HashMap::new()),
            allowed_ports: AllowedPorts::new(),
            allowed_hosts,
            bind_addresses,
            cancel: CancellationToken::new(),
        })
    }

    // ========================================================================
    // Handler registration
    // ========================================================================

    pub fn register_request_handler(&self, msg_type: &str, handler: RequestHandler) {
        self.request_handlers
            .write()
            .insert(msg_type.to_string(), handler);
    }

    pub fn register_event_handler(&self, msg_type: &str, handler: EventHandler) {
        self.event_handlers
            .write()
            .insert(msg_type.to_string(), handler);
    }

    // ========================================================================
    // Allowlist
    // ========================================================================

    pub fn add_allowed_port(&self, port: u16) {
        self.allowed_ports.add(port);
    }

    pub fn remove_allowed_port(&self, port: u16) {
        self.allowed_ports.remove(port);
    }

    // ========================================================================
    // Connections
    // ========================================================================

    pub fn connection(&self, name: &str) -> Option<Arc<ContainerConnection>> {
        self.connections.get(name).map(|entry| entry.value().clone())
    }

    pub fn connection_names(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn connections_snapshot(&self) -> Vec<Arc<ContainerConnection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// (connected containers, total forwards) for the status view.
    pub fn stats(&self) -> (usize, usize) {
        let connected = self.connections.len();
        let forwards = self
            .connections
            .iter()
            .map(|entry| entry.value().forward_count())
            .sum();
        (connected, forwards)
    }

    /// Find which connection owns a forwarded port. Returns the container
    /// name and `"exposed"` (remote forward) or `"forwarded"` (local).
    pub fn find_forward(&self, port: u16) -> Option<(String, &'static str)> {
        for entry in self.connections.iter() {
            let conn = entry.value();
            if conn.remote_forwards.lock().iter().any(|f| f.host_port == port) {
                return Some((entry.key().clone(), "exposed"));
            }
            if conn.local_forwards.lock().iter().any(|f| f.host_port == port) {
                return Some((entry.key().clone(), "forwarded"));
            }
        }
        None
    }

    /// Synchronous host-to-container request with a deadline.
    pub async fn request_to_container(
        &self,
        container: &str,
        msg_type: &str,
        payload: Value,
        timeout: std::time::Duration,
    ) -> Result<Value> {
        let conn = self
            .connection(container)
            .ok_or_else(|| DaemonError::SshDisconnected(container.to_string()))?;
        conn.request(msg_type, payload, timeout).await
    }

    /// One-way event to a container.
    pub async fn send_to_container(
        &self,
        container: &str,
        msg_type: &str,
        payload: Value,
    ) -> Result<()> {
        let conn = self
            .connection(container)
            .ok_or_else(|| DaemonError::SshDisconnected(container.to_string()))?;
        conn.send_event(msg_type, payload).await
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    async fn dispatch_request(&self, container: &str, msg_type: &str, payload: Value) -> Value {
        let handler = self.request_handlers.read().get(msg_type).cloned();
        match handler {
            Some(handler) => handler(container.to_string(), payload).await,
            None => {
                debug!("No request handler for type {msg_type}");
                json!({"ok": false, "error": "unknown"})
            }
        }
    }

    async fn dispatch_event(&self, container: &str, msg_type: &str, payload: Value) {
        let handler = self.event_handlers.read().get(msg_type).cloned();
        match handler {
            Some(handler) => handler(container.to_string(), payload).await,
            None => debug!("No event handler for type {msg_type}"),
        }
    }

    /// Handle one decoded control-channel frame. Events are dispatched
    /// inline so per-connection ordering is preserved; requests run on their
    /// own task since responses are matched by id.
    async fn on_control_frame(
        self: &Arc<Self>,
        conn: &Arc<ContainerConnection>,
        frame: Frame,
    ) {
        match frame.kind {
            FrameKind::Response => {
                if let Some(id) = frame.id.as_deref() {
                    conn.resolve_response(id, frame.payload);
                } else {
                    debug!("{}: response frame without id", conn.name);
                }
            }
            FrameKind::Request => {
                let Some(id) = frame.id.clone() else {
                    debug!("{}: request frame without id", conn.name);
                    return;
                };
                let server = self.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    let result = server
                        .dispatch_request(&conn.name, &frame.msg_type, frame.payload)
                        .await;
                    conn.send_response(&frame.msg_type, &id, result).await;
                });
            }
            FrameKind::Event => {
                self.dispatch_event(&conn.name, &frame.msg_type, frame.payload)
                    .await;
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bind the unix socket and start accepting container connections.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let socket_path = &self.config.socket_path;
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let key = self.load_or_generate_key()?;
        let ssh_config = Arc::new(russh::server::Config {
            keys: vec![key],
            methods: russh::MethodSet::NONE | russh::MethodSet::PASSWORD,
            auth_rejection_time: std::time::Duration::from_secs(0),
            auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
            ..Default::default()
        });

        info!("SSH tunnel server listening on {}", socket_path.display());

        let server = self.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = server.cancel.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            error!("Failed to accept SSH connection: {e}");
                            continue;
                        }
                    },
                };
                server.spawn_session(ssh_config.clone(), stream);
            }
        });

        // Re-bind remote-forward listeners whenever the bind set changes.
        let server = self.clone();
        let mut bind_rx = self.bind_addresses.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = server.cancel.cancelled() => return,
                    changed = bind_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let addrs = bind_rx.borrow().clone();
                        info!("Bind addresses changed to {addrs:?}, re-binding forwards");
                        for conn in server.connections_snapshot() {
                            conn.rebind_remote_forwards(&addrs).await;
                        }
                    }
                }
            }
        });

        Ok(())
    }

    fn spawn_session(self: &Arc<Self>, config: Arc<russh::server::Config>, stream: UnixStream) {
        let server = self.clone();
        let shared = Arc::new(SessionShared::default());
        let handler = SshHandler {
            server: server.clone(),
            shared: shared.clone(),
        };

        tokio::spawn(async move {
            match russh::server::run_stream(config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        debug!("SSH session ended: {e:?}");
                    }
                }
                Err(e) => {
                    debug!("SSH handshake failed: {e:?}");
                }
            }
            server.cleanup_session(&shared).await;
        });
    }

    /// Remove a finished session's connection and fire the disconnect event.
    /// Idempotent: a newer connection under the same name is left alone.
    async fn cleanup_session(self: &Arc<Self>, shared: &SessionShared) {
        let Some(conn) = shared.conn.lock().take() else {
            return;
        };
        conn.close();
        self.connections
            .remove_if(&conn.name, |_, current| Arc::ptr_eq(current, &conn));
        info!("SSH tunnel: container {} disconnected", conn.name);
        self.dispatch_event(&conn.name, EVENT_CONTAINER_DISCONNECT, Value::Null)
            .await;
    }

    /// Stop accepting, close every connection, and unlink the socket.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let names: Vec<String> = self.connection_names();
        for name in names {
            if let Some((_, conn)) = self.connections.remove(&name) {
                conn.close();
            }
        }
        let _ = std::fs::remove_file(&self.config.socket_path);
        info!("SSH tunnel server stopped");
    }

    fn load_or_generate_key(&self) -> Result<KeyPair> {
        let key_path = &self.config.host_key_path;

        if key_path.exists() {
            match russh_keys::load_secret_key(key_path, None) {
                Ok(key) => return Ok(key),
                Err(e) => {
                    warn!("Failed to load host key: {e}, generating a new one");
                }
            }
        }

        let key = KeyPair::generate_ed25519();

        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut key_file = std::fs::File::create(key_path)?;
        russh_keys::encode_pkcs8_pem(&key, &mut key_file)
            .map_err(|e| DaemonError::Internal(format!("encode host key: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(key)
    }
}

/// State shared between a session's handler and its cleanup.
#[derive(Default)]
struct SessionShared {
    name: Mutex<Option<String>>,
    conn: Mutex<Option<Arc<ContainerConnection>>>,
    control_channel: Mutex<Option<ChannelId>>,
    decode_buf: Mutex<BytesMut>,
}

/// Per-connection SSH handler.
struct SshHandler {
    server: Arc<TunnelServer>,
    shared: Arc<SessionShared>,
}

impl SshHandler {
    fn container_name(&self) -> Option<String> {
        self.shared.name.lock().clone()
    }
}

#[async_trait]
impl Handler for SshHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> std::result::Result<Auth, Self::Error> {
        // The unix socket peer is trusted; the username names the container.
        *self.shared.name.lock() = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn auth_password(
        &mut self,
        user: &str,
        _password: &str,
    ) -> std::result::Result<Auth, Self::Error> {
        *self.shared.name.lock() = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        debug!("Channel open session on channel {}", channel.id());
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if name != CONTROL_SUBSYSTEM {
            warn!("Unknown subsystem requested: {name}");
            session.channel_failure(channel_id);
            return Ok(());
        }

        let Some(container) = self.container_name() else {
            warn!("Control subsystem requested before authentication");
            session.channel_failure(channel_id);
            return Ok(());
        };

        let conn = ContainerConnection::new(container.clone(), session.handle(), channel_id);

        if let Some(old) = self
            .server
            .connections
            .insert(container.clone(), conn.clone())
        {
            warn!("Replacing stale connection for {container}");
            old.close();
        }
        *self.shared.conn.lock() = Some(conn);
        *self.shared.control_channel.lock() = Some(channel_id);

        info!("SSH tunnel: container {container} connected");
        session.channel_success(channel_id);

        self.server
            .dispatch_event(&container, EVENT_CONTAINER_CONNECT, Value::Null)
            .await;
        Ok(())
    }

    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if *self.shared.control_channel.lock() != Some(channel_id) {
            return Ok(());
        }
        let Some(conn) = self.shared.conn.lock().clone() else {
            return Ok(());
        };

        // Frames are decoded and dispatched in arrival order. A frame that
        // overflows the size cap or fails to parse closes the connection.
        let frames = {
            let mut buf = self.shared.decode_buf.lock();
            buf.extend_from_slice(data);

            let mut codec = FrameCodec;
            let mut frames = Vec::new();
            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break,
                    Err(e) => {
                        error!("{}: invalid control frame: {e}", conn.name);
                        return Err(russh::Error::Disconnect);
                    }
                }
            }
            frames
        };

        for frame in frames {
            self.server.on_control_frame(&conn, frame).await;
        }
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        let host_port = *port as u16;
        let Some(conn) = self.shared.conn.lock().clone() else {
            return Ok(false);
        };

        if !self.server.allowed_ports.contains(host_port) {
            warn!(
                "{}: remote forward for {address}:{host_port} refused (not allowed)",
                conn.name
            );
            return Ok(false);
        }

        let addrs = self.server.bind_addresses.borrow().clone();
        match conn.bind_remote_forward(&addrs, host_port).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("{}: remote forward {host_port} failed: {e}", conn.name);
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        port: u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        if let Some(conn) = self.shared.conn.lock().clone() {
            conn.remove_remote_forward(port as u16);
        }
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        let container = self.container_name().unwrap_or_default();
        let port = port_to_connect as u16;

        if !self.server.allowed_hosts.contains(host_to_connect)
            || !self.server.allowed_ports.contains(port)
        {
            warn!("{container}: direct-tcpip to {host_to_connect}:{port} refused");
            return Ok(false);
        }

        let target = (host_to_connect.to_string(), port);
        tokio::spawn(async move {
            match tokio::net::TcpStream::connect(target).await {
                Ok(mut stream) => {
                    let mut channel_stream = channel.into_stream();
                    let _ =
                        tokio::io::copy_bidirectional(&mut stream, &mut channel_stream).await;
                }
                Err(e) => {
                    debug!("direct-tcpip connect failed: {e}");
                }
            }
        });
        Ok(true)
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if *self.shared.control_channel.lock() == Some(channel_id) {
            debug!("Control channel {channel_id} closed");
            // Session teardown (and cleanup_session) follows shortly; the
            // writer stops as soon as the channel is gone.
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        debug!("Channel {channel_id} EOF");
        Ok(())
    }
}
