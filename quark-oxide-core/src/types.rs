//! Endpoint and cluster-membership types

use std::fmt;
use std::net::SocketAddr;

/// A `host:port` pair before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse from `host:port`. Returns `None` if the port is missing or
    /// unparseable.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.trim().rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }

    /// The hostname or address literal
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The TCP port
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An ordered list of cluster members to try when connecting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Members {
    endpoints: Vec<Endpoint>,
}

impl Members {
    /// A single-member list
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoints: vec![Endpoint::new(host, port)],
        }
    }

    /// Parse a comma-separated `host1:port1,host2:port2` list. Entries
    /// without a valid port are skipped.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        Self {
            endpoints: s.split(',').filter_map(Endpoint::parse).collect(),
        }
    }

    /// Append a member
    pub fn push(&mut self, endpoint: Endpoint) {
        self.endpoints.push(endpoint);
    }

    /// The members, in connection-attempt order
    #[must_use]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Whether the list is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl From<Endpoint> for Members {
    fn from(ep: Endpoint) -> Self {
        Self {
            endpoints: vec![ep],
        }
    }
}

/// Address family of a resolved endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

/// Socket type of a resolved endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// TCP
    Stream,
    /// UDP
    Datagram,
}

/// A fully resolved endpoint, ready for `connect()`. The original hostname
/// is retained for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    family: AddressFamily,
    socket_type: SocketType,
    address: SocketAddr,
    original_host: String,
}

impl ServiceEndpoint {
    /// Build from a resolved socket address
    pub fn new(address: SocketAddr, original_host: impl Into<String>) -> Self {
        let family = if address.is_ipv4() {
            AddressFamily::V4
        } else {
            AddressFamily::V6
        };
        Self {
            family,
            socket_type: SocketType::Stream,
            address,
            original_host: original_host.into(),
        }
    }

    /// Address family
    #[must_use]
    pub const fn family(&self) -> AddressFamily {
        self.family
    }

    /// Socket type
    #[must_use]
    pub const fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    /// The resolved socket address
    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    /// The hostname this endpoint was resolved from
    #[must_use]
    pub fn original_host(&self) -> &str {
        &self.original_host
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.original_host)
    }
}
