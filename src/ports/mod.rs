// file: src/ports/mod.rs
// version: 1.0.0
// guid: d8fd3fda-21a6-4898-ad11-3d11fbde1d01

//! Custom port assignments for obfuscated services
//!
//! The registry is the only persisted state of a run. It is loaded on every
//! invocation, self-repairs conflicts left behind by earlier runs, and is
//! written back with owner-only permissions.

pub mod registry;
pub mod store;

pub use registry::{Allocation, PortRegistry, Repair};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::TcpListener;
use thiserror::Error;

/// Services whose listening port is configurable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Service {
    Ssh,
    KubeApi,
}

impl Service {
    /// Canonical order used for persistence and conflict repair
    pub const ALL: [Service; 2] = [Service::Ssh, Service::KubeApi];

    pub fn name(self) -> &'static str {
        match self {
            Service::Ssh => "ssh",
            Service::KubeApi => "kube-api",
        }
    }

    /// Key used in the persisted ports file
    pub fn config_key(self) -> &'static str {
        match self {
            Service::Ssh => "SSH_PORT",
            Service::KubeApi => "K3S_API_PORT",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Service::Ssh => 22,
            Service::KubeApi => 6443,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Service::Ssh => "OpenSSH daemon",
            Service::KubeApi => "Kubernetes API server (k3s)",
        }
    }

    /// Process names that legitimately own this service's socket
    pub fn daemon_names(self) -> &'static [&'static str] {
        match self {
            Service::Ssh => &["sshd"],
            Service::KubeApi => &["k3s-server", "k3s"],
        }
    }

    pub fn from_config_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.config_key() == key)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Service {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ssh" | "ssh_port" => Ok(Service::Ssh),
            "kube-api" | "k3s" | "api" | "k3s_api_port" => Ok(Service::KubeApi),
            _ => Err(PortError::UnknownService(s.to_string())),
        }
    }
}

/// A single service -> port binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAssignment {
    pub service: Service,
    pub port: u16,
    pub description: String,
}

impl PortAssignment {
    pub fn new(service: Service, port: u16) -> Self {
        Self {
            service,
            port,
            description: service.description().to_string(),
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.port < 1024
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("port {0} is outside the valid range 1-65535")]
    OutOfRange(u32),

    #[error("port {port} requested for {requested} is already assigned to {existing}")]
    Collision {
        port: u16,
        existing: Service,
        requested: Service,
    },

    #[error("invalid port value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("unknown service '{0}' (expected ssh or kube-api)")]
    UnknownService(String),
}

/// Parse a user-supplied port string, enforcing the numeric range
pub fn parse_port(value: &str) -> Result<u16, PortError> {
    let number: u32 = value.trim().parse().map_err(|_| PortError::InvalidValue {
        key: "port".to_string(),
        value: value.to_string(),
    })?;
    validate_range(number)
}

pub fn validate_range(port: u32) -> Result<u16, PortError> {
    match u16::try_from(port) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(PortError::OutOfRange(port)),
    }
}

/// Best-effort check for sockets already bound on the host
pub trait PortProbe {
    fn is_port_bound(&self, port: u16) -> bool;
}

impl<F> PortProbe for F
where
    F: Fn(u16) -> bool,
{
    fn is_port_bound(&self, port: u16) -> bool {
        self(port)
    }
}

/// Probes by attempting to bind the port on all interfaces.
///
/// Only `AddrInUse` counts as bound; permission errors on privileged ports
/// are treated as unknown (not bound).
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketProbe;

impl PortProbe for SocketProbe {
    fn is_port_bound(&self, port: u16) -> bool {
        match TcpListener::bind(("0.0.0.0", port)) {
            Ok(_) => false,
            Err(e) => e.kind() == std::io::ErrorKind::AddrInUse,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port("2222"), Ok(2222));
        assert_eq!(parse_port(" 65535 "), Ok(65535));
        assert_eq!(parse_port("0"), Err(PortError::OutOfRange(0)));
        assert_eq!(parse_port("70000"), Err(PortError::OutOfRange(70000)));
        assert!(matches!(parse_port("ssh"), Err(PortError::InvalidValue { .. })));
    }

    #[test]
    fn test_service_keys_round_trip() {
        for service in Service::ALL {
            assert_eq!(Service::from_config_key(service.config_key()), Some(service));
            assert_eq!(service.name().parse::<Service>(), Ok(service));
        }
        assert!("postgres".parse::<Service>().is_err());
    }

    #[test]
    fn test_socket_probe_detects_bound_listener() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(SocketProbe.is_port_bound(port));
    }
}
