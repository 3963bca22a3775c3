//! Edge Transport Layer
//!
//! Types and traits shared by edge transports: scheme-qualified transport
//! addresses, the authorization capability consulted before an endpoint
//! may hold an edge, and the edge abstraction itself. The concrete UDP
//! transport lives in [`udp`]; the NAT event history that feeds the
//! advertised-address list lives in [`nat`].

pub mod edge;
pub mod nat;
pub mod udp;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// URI scheme prefix for transport addresses.
const TA_SCHEME_PREFIX: &str = "ringmesh.";

/// Current wall-clock time as Unix milliseconds.
pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Errors related to transport addresses.
#[derive(Debug, Error)]
pub enum TaError {
    #[error("missing 'ringmesh.<type>://' scheme in '{0}'")]
    InvalidScheme(String),

    #[error("unknown transport type: {0}")]
    UnknownType(String),

    #[error("missing port in '{0}'")]
    MissingPort(String),

    #[error("invalid port in '{0}'")]
    InvalidPort(String),

    #[error("host is not a literal IP address: {0}")]
    HostNotIp(String),
}

/// Kind of transport an address names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaType {
    /// UDP datagram transport (the only kind this crate serves).
    Udp,
    /// TCP stream transport.
    Tcp,
    /// TLS over TCP.
    Tls,
}

impl TaType {
    /// Scheme suffix for the canonical string form.
    pub fn name(&self) -> &'static str {
        match self {
            TaType::Udp => "udp",
            TaType::Tcp => "tcp",
            TaType::Tls => "tls",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "udp" => Some(TaType::Udp),
            "tcp" => Some(TaType::Tcp),
            "tls" => Some(TaType::Tls),
            _ => None,
        }
    }
}

impl fmt::Display for TaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An endpoint descriptor: transport type, host, and port.
///
/// Canonical string form is `ringmesh.<type>://<host>:<port>`, with IPv6
/// hosts bracketed. Equality is structural.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TransportAddress {
    ta_type: TaType,
    host: String,
    port: u16,
}

impl TransportAddress {
    /// Create a transport address.
    pub fn new(ta_type: TaType, host: impl Into<String>, port: u16) -> Self {
        Self {
            ta_type,
            host: host.into(),
            port,
        }
    }

    /// Create a UDP transport address.
    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Self::new(TaType::Udp, host, port)
    }

    /// Build a UDP transport address from a socket address.
    ///
    /// An unspecified bind host is rewritten to the loopback address so
    /// the result is always routable on the local machine.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        Self::new(TaType::Udp, ip.to_string(), addr.port())
    }

    /// Get the transport type.
    pub fn ta_type(&self) -> TaType {
        self.ta_type
    }

    /// Get the host part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolve to a socket address. The host must be a literal IP.
    pub fn to_socket_addr(&self) -> Result<SocketAddr, TaError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| TaError::HostNotIp(self.host.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(
                f,
                "{}{}://[{}]:{}",
                TA_SCHEME_PREFIX,
                self.ta_type.name(),
                self.host,
                self.port
            )
        } else {
            write!(
                f,
                "{}{}://{}:{}",
                TA_SCHEME_PREFIX,
                self.ta_type.name(),
                self.host,
                self.port
            )
        }
    }
}

impl fmt::Debug for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportAddress(\"{}\")", self)
    }
}

impl FromStr for TransportAddress {
    type Err = TaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(TA_SCHEME_PREFIX)
            .ok_or_else(|| TaError::InvalidScheme(s.to_string()))?;
        let (type_name, rest) = rest
            .split_once("://")
            .ok_or_else(|| TaError::InvalidScheme(s.to_string()))?;
        let ta_type =
            TaType::from_name(type_name).ok_or_else(|| TaError::UnknownType(type_name.into()))?;

        let (host, port_str) = if let Some(rest) = rest.strip_prefix('[') {
            // Bracketed IPv6: [host]:port
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| TaError::InvalidScheme(s.to_string()))?;
            let port_str = after
                .strip_prefix(':')
                .ok_or_else(|| TaError::MissingPort(s.to_string()))?;
            (host, port_str)
        } else {
            rest.rsplit_once(':')
                .ok_or_else(|| TaError::MissingPort(s.to_string()))?
        };

        let port: u16 = port_str
            .parse()
            .map_err(|_| TaError::InvalidPort(s.to_string()))?;
        Ok(Self::new(ta_type, host, port))
    }
}

/// Capability deciding whether an endpoint may hold an edge.
///
/// Consulted by the listener for every fresh inbound edge and for every
/// NAT remap of an existing edge.
pub trait TaAuthorizer: Send + Sync {
    /// Return true to accept the endpoint.
    fn authorize(&self, ta: &TransportAddress) -> bool;
}

/// Default authorizer: accepts everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl TaAuthorizer for AllowAll {
    fn authorize(&self, _ta: &TransportAddress) -> bool {
        true
    }
}
