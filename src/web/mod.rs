//! Read-only status web server.
//!
//! Serves daemon state (tunnel stats, active ports, mirrored session
//! buffers) to the dashboard. Rebinds when the Tailscale monitor observes a
//! new IP.

mod server;

pub use server::spawn;
