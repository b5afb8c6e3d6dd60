//! Backend targets and connection identity.
//!
//! A backend target is one configured server. Every outbound connection to it
//! is either a watchdog (persistent, not tied to any client) or client-bound
//! (created for, and torn down with, one inbound client). The mode is an
//! explicit tag; registry key strings are for logging and uniqueness only and
//! are never parsed back.

use std::fmt;
use std::net::{AddrParseError, IpAddr, SocketAddr};

use serde::Deserialize;

/// Key prefix for watchdog connections.
pub const WATCHDOG_PREFIX: &str = "watchdog";

/// A configured backend server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct BackendTarget {
    /// IP address of the backend.
    pub address: String,
    /// Backend port.
    pub port: u16,
}

impl BackendTarget {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Identity key: `address:port`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Resolve the socket address to dial.
    pub fn socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        let ip: IpAddr = self.address.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Lifecycle mode of an outbound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Persistent liveness connection, redials for the life of the process.
    Watchdog,
    /// Private backend connection for a single client.
    ClientBound {
        /// Local endpoint of the client socket the connection serves.
        client_endpoint: String,
    },
}

impl ConnectionMode {
    pub fn is_watchdog(&self) -> bool {
        matches!(self, Self::Watchdog)
    }

    /// Compose the registry key for a connection dialed from `local_port`.
    pub fn connection_key(&self, local_port: u16, target: &BackendTarget) -> String {
        let prefix = match self {
            Self::Watchdog => WATCHDOG_PREFIX,
            Self::ClientBound { client_endpoint } => client_endpoint.as_str(),
        };
        format!("{}-{}-{}", prefix, local_port, target.key())
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Watchdog => f.write_str("watchdog"),
            Self::ClientBound { .. } => f.write_str("client"),
        }
    }
}
