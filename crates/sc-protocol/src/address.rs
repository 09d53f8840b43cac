//! Endpoint addresses: parsing, classification and ordering.
//!
//! The mesh-formation rule ("the smaller address dials") requires every
//! daemon to agree on one total order, so ordering compares the raw
//! `(family, address bytes, port)` tuple and never formatted strings.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid address \"{0}\"")]
    Invalid(String),
    #[error("invalid port in \"{0}\"")]
    InvalidPort(String),
}

/// Where an address lives, network-wise.  Broadcast scopes and listener
/// policies depend on this split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Loopback,
    Private,
    Public,
}

/// An IPv4 or IPv6 endpoint with a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    ip: IpAddr,
    port: u16,
}

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Parse `a.b.c.d`, `a.b.c.d:p`, `[v6]` or `[v6]:p`, defaulting the port
    /// when absent.
    pub fn parse(input: &str, default_port: u16) -> Result<Self, AddressError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AddressError::Invalid(input.to_owned()));
        }

        if let Some(rest) = input.strip_prefix('[') {
            // Bracketed IPv6, optionally followed by ":port".
            let end = rest
                .find(']')
                .ok_or_else(|| AddressError::Invalid(input.to_owned()))?;
            let ip: Ipv6Addr = rest[..end]
                .parse()
                .map_err(|_| AddressError::Invalid(input.to_owned()))?;
            let port = match &rest[end + 1..] {
                "" => default_port,
                tail => tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| AddressError::InvalidPort(input.to_owned()))?,
            };
            return Ok(Self::new(IpAddr::V6(ip), port));
        }

        match input.rfind(':') {
            Some(pos) => {
                let ip: Ipv4Addr = input[..pos]
                    .parse()
                    .map_err(|_| AddressError::Invalid(input.to_owned()))?;
                let port = input[pos + 1..]
                    .parse()
                    .map_err(|_| AddressError::InvalidPort(input.to_owned()))?;
                Ok(Self::new(IpAddr::V4(ip), port))
            }
            None => {
                let ip: Ipv4Addr = input
                    .parse()
                    .map_err(|_| AddressError::Invalid(input.to_owned()))?;
                Ok(Self::new(IpAddr::V4(ip), default_port))
            }
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// The address without the port: dotted IPv4 or bracketed IPv6.
    pub fn ip_string(&self) -> String {
        match self.ip {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{ip}]"),
        }
    }

    pub fn network_kind(&self) -> NetworkKind {
        match self.ip {
            IpAddr::V4(ip) => {
                if ip.is_loopback() {
                    NetworkKind::Loopback
                } else if ip.is_private() || ip.is_link_local() {
                    NetworkKind::Private
                } else {
                    NetworkKind::Public
                }
            }
            IpAddr::V6(ip) => {
                if ip.is_loopback() {
                    NetworkKind::Loopback
                } else if is_unique_local(&ip) || is_unicast_link_local(&ip) {
                    NetworkKind::Private
                } else {
                    NetworkKind::Public
                }
            }
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.network_kind() == NetworkKind::Loopback
    }
}

// fc00::/7
fn is_unique_local(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xfe00 == 0xfc00
}

// fe80::/10
fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        fn key(addr: &Address) -> (u8, [u8; 16], u16) {
            match addr.ip {
                IpAddr::V4(ip) => {
                    let mut bytes = [0u8; 16];
                    bytes[..4].copy_from_slice(&ip.octets());
                    (4, bytes, addr.port)
                }
                IpAddr::V6(ip) => (6, ip.octets(), addr.port),
            }
        }
        key(self).cmp(&key(other))
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip_string(), self.port)
    }
}
