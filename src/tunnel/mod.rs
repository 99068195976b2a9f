//! SSH control plane to the containers.
//!
//! Every running container dials the host's `ssh.sock` and opens one control
//! channel carrying length-prefixed JSON frames, plus SSH port-forwarding
//! channels in both directions. The server side lives here.

mod connection;
mod forwards;
mod server;

pub use connection::ContainerConnection;
pub use forwards::{AllowedPorts, ForwardRecord};
pub use server::{ServerConfig, TunnelServer};

use futures_util::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

/// Handler for a control-channel request; its return becomes the response
/// payload. The first argument is the container name.
pub type RequestHandler =
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, Value> + Send + Sync>;

/// Handler for a one-way control-channel event.
pub type EventHandler = Arc<dyn Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Internal lifecycle event fired when a container's control channel opens.
pub const EVENT_CONTAINER_CONNECT: &str = "_container_connect";

/// Internal lifecycle event fired when a container disconnects.
pub const EVENT_CONTAINER_DISCONNECT: &str = "_container_disconnect";
