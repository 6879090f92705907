// ============================================
// File: crates/proxytun-common/src/types.rs
// ============================================
//! # Core Type Definitions
//!
//! ## Creation Reason
//! Centralizes the identity of a network flow and the small enums that
//! describe it, so the packet codec, flow table and relays all key on the
//! same value.
//!
//! ## Main Functionality
//! - `TransportProtocol`: TCP or UDP
//! - `FlowKey`: (protocol, source, destination) 5-tuple
//! - `ProxyKind`: HTTP CONNECT or SOCKS5 upstream
//!
//! ## ⚠️ Important Note for Next Developer
//! - A `FlowKey` is directional. Packets from the originator carry the key
//!   as-is; packets synthesized back use `key.reversed()`.
//! - `ProxyKind` accepts the upper-case names stored by older settings
//!   screens ("HTTP", "SOCKS") as well as lower-case config values.
//!
//! ## Last Modified
//! v0.1.0 - Initial type definitions

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CommonError;

// ============================================
// TransportProtocol
// ============================================

/// Transport protocol carried by a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    /// Transmission Control Protocol (IP protocol 6).
    Tcp,
    /// User Datagram Protocol (IP protocol 17).
    Udp,
}

impl TransportProtocol {
    /// IANA protocol number for TCP.
    pub const TCP_NUMBER: u8 = 6;
    /// IANA protocol number for UDP.
    pub const UDP_NUMBER: u8 = 17;

    /// Maps an IP protocol / next-header number to a transport protocol.
    #[must_use]
    pub const fn from_number(number: u8) -> Option<Self> {
        match number {
            Self::TCP_NUMBER => Some(Self::Tcp),
            Self::UDP_NUMBER => Some(Self::Udp),
            _ => None,
        }
    }

    /// Returns the IP protocol number.
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::Tcp => Self::TCP_NUMBER,
            Self::Udp => Self::UDP_NUMBER,
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

// ============================================
// FlowKey
// ============================================

/// Identity of one direction of a network flow.
///
/// Two packets with equal keys belong to the same flow in the same
/// direction.
///
/// # Example
/// ```
/// use proxytun_common::types::{FlowKey, TransportProtocol};
///
/// let key = FlowKey::new(
///     TransportProtocol::Tcp,
///     "10.0.0.2:40000".parse().unwrap(),
///     "93.184.216.34:443".parse().unwrap(),
/// );
/// assert_eq!(key.reversed().src, key.dst);
/// assert_eq!(key.reversed().reversed(), key);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Transport protocol.
    pub protocol: TransportProtocol,
    /// Source address and port.
    pub src: SocketAddr,
    /// Destination address and port.
    pub dst: SocketAddr,
}

impl FlowKey {
    /// Creates a new flow key.
    #[must_use]
    pub const fn new(protocol: TransportProtocol, src: SocketAddr, dst: SocketAddr) -> Self {
        Self { protocol, src, dst }
    }

    /// Returns the key of the opposite direction (source and destination
    /// swapped).
    #[must_use]
    pub const fn reversed(&self) -> Self {
        Self {
            protocol: self.protocol,
            src: self.dst,
            dst: self.src,
        }
    }

    /// Returns `true` for TCP flows.
    #[must_use]
    pub const fn is_tcp(&self) -> bool {
        matches!(self.protocol, TransportProtocol::Tcp)
    }

    /// Returns `true` if both endpoints are IPv4.
    #[must_use]
    pub const fn is_ipv4(&self) -> bool {
        self.src.is_ipv4() && self.dst.is_ipv4()
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.src, self.dst)
    }
}

// ============================================
// ProxyKind
// ============================================

/// Upstream proxy protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// HTTP proxy using the CONNECT method.
    #[default]
    #[serde(alias = "HTTP")]
    Http,
    /// SOCKS version 5 proxy.
    #[serde(alias = "SOCKS", alias = "socks5", alias = "SOCKS5")]
    Socks,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Socks => write!(f, "socks5"),
        }
    }
}

impl FromStr for ProxyKind {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "socks" | "socks5" => Ok(Self::Socks),
            other => Err(CommonError::invalid_input(
                "proxy.type",
                format!("unknown proxy type '{other}', expected http or socks"),
            )),
        }
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FlowKey {
        FlowKey::new(
            TransportProtocol::Udp,
            "10.0.0.2:5353".parse().unwrap(),
            "8.8.8.8:53".parse().unwrap(),
        )
    }

    #[test]
    fn test_protocol_numbers() {
        assert_eq!(TransportProtocol::from_number(6), Some(TransportProtocol::Tcp));
        assert_eq!(TransportProtocol::from_number(17), Some(TransportProtocol::Udp));
        assert_eq!(TransportProtocol::from_number(1), None);
        assert_eq!(TransportProtocol::Udp.number(), 17);
    }

    #[test]
    fn test_flow_key_reversed() {
        let k = key();
        let r = k.reversed();
        assert_eq!(r.src, k.dst);
        assert_eq!(r.dst, k.src);
        assert_eq!(r.protocol, k.protocol);
        assert_ne!(r, k);
    }

    #[test]
    fn test_flow_key_display() {
        assert_eq!(key().to_string(), "udp 10.0.0.2:5353 -> 8.8.8.8:53");
    }

    #[test]
    fn test_flow_key_hash_identity() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(key());
        set.insert(key());
        set.insert(key().reversed());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_proxy_kind_parse() {
        assert_eq!("HTTP".parse::<ProxyKind>().unwrap(), ProxyKind::Http);
        assert_eq!("socks".parse::<ProxyKind>().unwrap(), ProxyKind::Socks);
        assert_eq!("Socks5".parse::<ProxyKind>().unwrap(), ProxyKind::Socks);
        assert!("ftp".parse::<ProxyKind>().is_err());
        assert_eq!(ProxyKind::default(), ProxyKind::Http);
    }
}
