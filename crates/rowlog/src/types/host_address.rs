use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Network address (host:port) published through the coordination store, either for a
/// processor's wake-up listener or for a remote subscription listener.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
}

impl HostAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string, as stored by key/value coordination backends.
    pub fn parse(value: &str) -> Option<Self> {
        let (host, port) = value.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        let port = port.parse().ok()?;
        Some(Self::new(host, port))
    }

    /// Address with the host taken from `advertise_host` and the port from a bound socket.
    pub fn advertised(advertise_host: &str, bound: SocketAddr) -> Self {
        Self::new(advertise_host, bound.port())
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
