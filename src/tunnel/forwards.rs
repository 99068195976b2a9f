//! Port-forward records and the allowed-port gate.

use std::collections::HashSet;

use parking_lot::Mutex;
use serde::Serialize;

/// One active or registered TCP forward.
///
/// Remote forwards listen on the host and tunnel into the container; local
/// forwards listen inside the container and terminate on the host. Local
/// forwards are recorded for display and conflict checks only — the listener
/// lives on the container side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardRecord {
    pub host_port: u16,
    pub container_port: u16,
    pub listen_host: String,
    pub name: String,
}

impl ForwardRecord {
    pub fn new(host_port: u16, container_port: u16, listen_host: &str, name: &str) -> Self {
        Self {
            host_port,
            container_port,
            listen_host: listen_host.to_string(),
            name: name.to_string(),
        }
    }
}

/// Runtime-extensible allowlist gating remote-forward listen ports and
/// direct-tcpip target ports.
#[derive(Debug, Default)]
pub struct AllowedPorts {
    ports: Mutex<HashSet<u16>>,
}

impl AllowedPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, port: u16) {
        self.ports.lock().insert(port);
    }

    pub fn remove(&self, port: u16) {
        self.ports.lock().remove(&port);
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ports.lock().contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowlist_add_remove() {
        let allowed = AllowedPorts::new();
        assert!(!allowed.contains(8123));

        allowed.add(8123);
        assert!(allowed.contains(8123));

        allowed.remove(8123);
        assert!(!allowed.contains(8123));
    }

    #[test]
    fn test_forward_record_serializes_for_display() {
        let record = ForwardRecord::new(8123, 80, "127.0.0.1", "dynamic-8123");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["host_port"], 8123);
        assert_eq!(value["container_port"], 80);
        assert_eq!(value["name"], "dynamic-8123");
    }
}
