// ============================================
// File: crates/proxytun-core/src/proxy/socks5.rs
// ============================================
//! # SOCKS5 Messages (RFC 1928, RFC 1929)
//!
//! ## Main Functionality
//! - Method negotiation ([`encode_greeting`], [`parse_method_selection`])
//! - Username/password sub-negotiation ([`encode_auth`], [`parse_auth_reply`])
//! - Requests and replies ([`encode_request`], [`parse_reply_header`],
//!   [`decode_bound_addr`])
//! - UDP relay header ([`encode_udp_datagram`], [`decode_udp_datagram`])
//!
//! ## Handshake Sequence
//! ```text
//! client                          server
//!   │ VER NMETHODS METHODS          │
//!   │──────────────────────────────►│
//!   │ VER METHOD                    │
//!   │◄──────────────────────────────│
//!   │ [RFC 1929 auth]               │
//!   │ VER CMD RSV ATYP ADDR PORT    │
//!   │──────────────────────────────►│
//!   │ VER REP RSV ATYP ADDR PORT    │
//!   │◄──────────────────────────────│
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Requests always carry a literal IP address; the tunnel only ever
//!   sees addresses, never names
//! - Replies may still carry a domain, so the reader must handle
//!   `ATYP_DOMAIN` when skipping the bound address

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::HandshakeError;

// ============================================
// Constants
// ============================================

/// SOCKS protocol version.
pub const SOCKS5_VERSION: u8 = 0x05;

/// No authentication required.
pub const AUTH_METHOD_NONE: u8 = 0x00;
/// Username/password authentication (RFC 1929).
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;
/// Server accepts none of the offered methods.
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;
/// RFC 1929 sub-negotiation version.
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;

/// CONNECT command.
pub const CMD_CONNECT: u8 = 0x01;
/// UDP ASSOCIATE command.
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// IPv4 address type.
pub const ATYP_IPV4: u8 = 0x01;
/// Domain name address type.
pub const ATYP_DOMAIN: u8 = 0x03;
/// IPv6 address type.
pub const ATYP_IPV6: u8 = 0x04;

/// Request succeeded.
pub const REPLY_SUCCEEDED: u8 = 0x00;

/// Length of the fixed part of a reply (VER REP RSV ATYP).
pub const REPLY_HEADER_LEN: usize = 4;

// ============================================
// Types
// ============================================

/// Authentication method chosen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication.
    None,
    /// RFC 1929 username/password.
    Password,
}

/// Request command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Open a TCP connection to the target.
    Connect,
    /// Set up a UDP relay.
    UdpAssociate,
}

impl Command {
    const fn code(self) -> u8 {
        match self {
            Self::Connect => CMD_CONNECT,
            Self::UdpAssociate => CMD_UDP_ASSOCIATE,
        }
    }
}

/// Remaining bytes of a reply after its fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundAddrLen {
    /// Exactly this many bytes (address + port).
    Fixed(usize),
    /// One length byte, then that many name bytes plus the port.
    Domain,
}

/// Human-readable meaning of a reply code.
#[must_use]
pub const fn reply_message(code: u8) -> &'static str {
    match code {
        REPLY_SUCCEEDED => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

// ============================================
// Method Negotiation
// ============================================

/// Encodes the greeting. Offers username/password in addition to no-auth
/// when credentials are configured.
#[must_use]
pub fn encode_greeting(with_password: bool) -> Vec<u8> {
    if with_password {
        vec![SOCKS5_VERSION, 2, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD]
    } else {
        vec![SOCKS5_VERSION, 1, AUTH_METHOD_NONE]
    }
}

/// Parses the server's method selection.
///
/// # Errors
/// Wrong version, `0xFF`, or a method that was not offered.
pub fn parse_method_selection(
    reply: [u8; 2],
    offered_password: bool,
) -> Result<AuthMethod, HandshakeError> {
    if reply[0] != SOCKS5_VERSION {
        return Err(HandshakeError::malformed(format!(
            "SOCKS version 0x{:02x} in method selection",
            reply[0]
        )));
    }
    match reply[1] {
        AUTH_METHOD_NONE => Ok(AuthMethod::None),
        AUTH_METHOD_PASSWORD if offered_password => Ok(AuthMethod::Password),
        AUTH_METHOD_NO_ACCEPTABLE => Err(HandshakeError::NoAcceptableMethod),
        other => Err(HandshakeError::malformed(format!(
            "server selected unoffered method 0x{other:02x}"
        ))),
    }
}

// ============================================
// Username/Password (RFC 1929)
// ============================================

/// Encodes the username/password request.
///
/// # Errors
/// Either field is empty or longer than 255 bytes.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_auth(username: &str, password: &str) -> Result<Vec<u8>, HandshakeError> {
    for (field, value) in [("username", username), ("password", password)] {
        if value.is_empty() || value.len() > 255 {
            return Err(HandshakeError::invalid_request(format!(
                "{field} must be 1-255 bytes"
            )));
        }
    }

    let mut out = Vec::with_capacity(3 + username.len() + password.len());
    out.push(AUTH_PASSWORD_VERSION);
    out.push(username.len() as u8);
    out.extend_from_slice(username.as_bytes());
    out.push(password.len() as u8);
    out.extend_from_slice(password.as_bytes());
    Ok(out)
}

/// Parses the username/password reply.
///
/// # Errors
/// Any non-zero status.
pub fn parse_auth_reply(reply: [u8; 2]) -> Result<(), HandshakeError> {
    if reply[0] != AUTH_PASSWORD_VERSION {
        return Err(HandshakeError::malformed(format!(
            "auth version 0x{:02x}",
            reply[0]
        )));
    }
    if reply[1] == 0 {
        Ok(())
    } else {
        Err(HandshakeError::AuthRejected(reply[1]))
    }
}

// ============================================
// Request / Reply
// ============================================

fn put_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&v6.octets());
        }
    }
    buf.put_u16(addr.port());
}

/// Encodes a request.
///
/// For UDP ASSOCIATE `addr` is the address the client will send from;
/// `0.0.0.0:0` lets the server accept any.
#[must_use]
pub fn encode_request(command: Command, addr: &SocketAddr) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(SOCKS5_VERSION);
    buf.put_u8(command.code());
    buf.put_u8(0x00);
    put_addr(&mut buf, addr);
    buf.to_vec()
}

/// Checks the fixed reply header and reports how much follows.
///
/// # Errors
/// Wrong version, a failure reply code, or an unknown address type.
pub fn parse_reply_header(header: [u8; REPLY_HEADER_LEN]) -> Result<BoundAddrLen, HandshakeError> {
    if header[0] != SOCKS5_VERSION {
        return Err(HandshakeError::malformed(format!(
            "SOCKS version 0x{:02x} in reply",
            header[0]
        )));
    }
    if header[1] != REPLY_SUCCEEDED {
        return Err(HandshakeError::Reply {
            code: header[1],
            message: reply_message(header[1]),
        });
    }
    match header[3] {
        ATYP_IPV4 => Ok(BoundAddrLen::Fixed(4 + 2)),
        ATYP_IPV6 => Ok(BoundAddrLen::Fixed(16 + 2)),
        ATYP_DOMAIN => Ok(BoundAddrLen::Domain),
        other => Err(HandshakeError::malformed(format!("address type 0x{other:02x}"))),
    }
}

/// Decodes the bound address that followed a reply header.
///
/// Returns `None` for domain addresses.
#[must_use]
pub fn decode_bound_addr(atyp: u8, rest: &[u8]) -> Option<SocketAddr> {
    let (ip, port_at) = match atyp {
        ATYP_IPV4 if rest.len() >= 6 => (
            IpAddr::V4(Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3])),
            4,
        ),
        ATYP_IPV6 if rest.len() >= 18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&rest[..16]);
            (IpAddr::V6(Ipv6Addr::from(octets)), 16)
        }
        _ => return None,
    };
    let port = u16::from_be_bytes([rest[port_at], rest[port_at + 1]]);
    Some(SocketAddr::new(ip, port))
}

// ============================================
// UDP Relay Header
// ============================================

/// Wraps a datagram for the UDP relay: `RSV(2) FRAG(1) ATYP ADDR PORT DATA`.
#[must_use]
pub fn encode_udp_datagram(dst: &SocketAddr, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(22 + payload.len());
    buf.put_u16(0);
    buf.put_u8(0);
    put_addr(&mut buf, dst);
    buf.put_slice(payload);
    buf.freeze()
}

/// Unwraps a datagram received from the UDP relay.
///
/// # Errors
/// Truncated header, fragmented datagram, or a domain address.
pub fn decode_udp_datagram(buf: &[u8]) -> Result<(SocketAddr, &[u8]), HandshakeError> {
    if buf.len() < 4 {
        return Err(HandshakeError::malformed("UDP relay header truncated"));
    }
    if buf[2] != 0 {
        return Err(HandshakeError::malformed("fragmented UDP relay datagram"));
    }
    let atyp = buf[3];
    let addr_len = match atyp {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            return Err(HandshakeError::malformed("domain address in UDP relay datagram"))
        }
        other => return Err(HandshakeError::malformed(format!("address type 0x{other:02x}"))),
    };
    let addr = decode_bound_addr(atyp, &buf[4..])
        .ok_or_else(|| HandshakeError::malformed("UDP relay header truncated"))?;
    Ok((addr, &buf[4 + addr_len..]))
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting() {
        assert_eq!(encode_greeting(false), vec![5, 1, 0]);
        assert_eq!(encode_greeting(true), vec![5, 2, 0, 2]);
    }

    #[test]
    fn test_method_selection() {
        assert_eq!(parse_method_selection([5, 0], false).unwrap(), AuthMethod::None);
        assert_eq!(parse_method_selection([5, 2], true).unwrap(), AuthMethod::Password);
        assert!(parse_method_selection([5, 2], false).is_err());
        assert_eq!(
            parse_method_selection([5, 0xff], true),
            Err(HandshakeError::NoAcceptableMethod)
        );
        assert!(parse_method_selection([4, 0], false).is_err());
    }

    #[test]
    fn test_auth() {
        assert_eq!(
            encode_auth("bob", "pw").unwrap(),
            vec![1, 3, b'b', b'o', b'b', 2, b'p', b'w']
        );
        assert!(encode_auth("", "pw").is_err());
        assert!(encode_auth("bob", &"x".repeat(256)).is_err());
        assert!(parse_auth_reply([1, 0]).is_ok());
        assert_eq!(parse_auth_reply([1, 1]), Err(HandshakeError::AuthRejected(1)));
    }

    #[test]
    fn test_connect_request() {
        let req = encode_request(Command::Connect, &"93.184.216.34:443".parse().unwrap());
        assert_eq!(req, vec![5, 1, 0, 1, 93, 184, 216, 34, 0x01, 0xbb]);

        let req = encode_request(Command::UdpAssociate, &"[::1]:53".parse().unwrap());
        assert_eq!(req.len(), 4 + 16 + 2);
        assert_eq!(req[1], CMD_UDP_ASSOCIATE);
        assert_eq!(req[3], ATYP_IPV6);
    }

    #[test]
    fn test_reply_header() {
        assert_eq!(parse_reply_header([5, 0, 0, 1]).unwrap(), BoundAddrLen::Fixed(6));
        assert_eq!(parse_reply_header([5, 0, 0, 4]).unwrap(), BoundAddrLen::Fixed(18));
        assert_eq!(parse_reply_header([5, 0, 0, 3]).unwrap(), BoundAddrLen::Domain);
        assert_eq!(
            parse_reply_header([5, 5, 0, 1]),
            Err(HandshakeError::Reply {
                code: 5,
                message: "connection refused"
            })
        );
        assert!(parse_reply_header([5, 0, 0, 9]).is_err());
    }

    #[test]
    fn test_bound_addr() {
        assert_eq!(
            decode_bound_addr(ATYP_IPV4, &[127, 0, 0, 1, 0x1f, 0x90]),
            Some("127.0.0.1:8080".parse().unwrap())
        );
        assert_eq!(decode_bound_addr(ATYP_IPV4, &[127, 0, 0]), None);
        assert_eq!(decode_bound_addr(ATYP_DOMAIN, &[3, b'a', b'b', b'c', 0, 80]), None);
    }

    #[test]
    fn test_udp_header() {
        let dst: SocketAddr = "8.8.8.8:53".parse().unwrap();
        let wrapped = encode_udp_datagram(&dst, b"query");
        assert_eq!(&wrapped[..4], &[0, 0, 0, ATYP_IPV4]);

        let (addr, payload) = decode_udp_datagram(&wrapped).unwrap();
        assert_eq!(addr, dst);
        assert_eq!(payload, b"query");

        let mut fragmented = wrapped.to_vec();
        fragmented[2] = 1;
        assert!(decode_udp_datagram(&fragmented).is_err());
        assert!(decode_udp_datagram(&wrapped[..7]).is_err());
    }
}
