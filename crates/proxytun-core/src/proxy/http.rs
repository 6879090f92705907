// ============================================
// File: crates/proxytun-core/src/proxy/http.rs
// ============================================
//! # HTTP CONNECT
//!
//! ## Main Functionality
//! - [`encode_connect`]: request with `Host` and optional Basic
//!   `Proxy-Authorization`
//! - [`parse_response_head`]: incremental parse of the proxy's reply head
//!
//! ## ⚠️ Important Note for Next Developer
//! - Only status 200 counts as success; 2xx variants are refused
//! - Bytes after the blank line belong to the tunnelled stream and must
//!   be handed to the caller, not discarded

use std::net::SocketAddr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::HandshakeError;

/// Maximum size of the proxy's response head.
pub const MAX_RESPONSE_HEAD: usize = 8 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Encodes a `CONNECT` request for `target`.
///
/// IPv6 targets are written in bracketed form (`[2001:db8::1]:443`).
///
/// # Example
/// ```
/// use proxytun_core::proxy::http::encode_connect;
///
/// let req = encode_connect(&"93.184.216.34:443".parse().unwrap(), None);
/// assert!(req.starts_with(b"CONNECT 93.184.216.34:443 HTTP/1.1\r\n"));
/// ```
#[must_use]
pub fn encode_connect(target: &SocketAddr, credentials: Option<(&str, &str)>) -> Vec<u8> {
    let authority = target.to_string();
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some((username, password)) = credentials {
        let token = STANDARD.encode(format!("{username}:{password}"));
        request.push_str("Proxy-Authorization: Basic ");
        request.push_str(&token);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request.into_bytes()
}

/// Parsed status line of a proxy response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// HTTP status code.
    pub status: u16,
    /// Reason phrase (may be empty).
    pub reason: String,
    /// Length of the head including the terminating blank line.
    pub head_len: usize,
}

impl ResponseHead {
    /// Returns `true` if the tunnel is established.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status == 200
    }

    /// Converts a refusal into a [`HandshakeError::Status`].
    ///
    /// # Errors
    /// Returns an error for any status other than 200.
    pub fn into_result(self) -> Result<Self, HandshakeError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(HandshakeError::Status {
                status: self.status,
                reason: self.reason,
            })
        }
    }
}

/// Parses the response head accumulated so far.
///
/// Returns `Ok(None)` while the blank line has not arrived yet.
///
/// # Errors
/// - `HeadTooLarge` once `buf` reaches [`MAX_RESPONSE_HEAD`] without a
///   terminator
/// - `Malformed` if the status line is not `HTTP/1.x <code> [reason]`
pub fn parse_response_head(buf: &[u8]) -> Result<Option<ResponseHead>, HandshakeError> {
    let Some(end) = buf
        .windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
    else {
        if buf.len() >= MAX_RESPONSE_HEAD {
            return Err(HandshakeError::HeadTooLarge {
                max: MAX_RESPONSE_HEAD,
            });
        }
        return Ok(None);
    };

    let head_len = end + HEAD_TERMINATOR.len();
    if head_len > MAX_RESPONSE_HEAD {
        return Err(HandshakeError::HeadTooLarge {
            max: MAX_RESPONSE_HEAD,
        });
    }

    let line_end = buf[..end]
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(end);
    let line = std::str::from_utf8(&buf[..line_end])
        .map_err(|_| HandshakeError::malformed("status line is not UTF-8"))?;

    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(HandshakeError::malformed(format!("unexpected protocol '{version}'")));
    }
    let status = parts
        .next()
        .filter(|code| code.len() == 3)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| HandshakeError::malformed("missing status code"))?;
    let reason = parts.next().unwrap_or_default().trim().to_string();

    Ok(Some(ResponseHead {
        status,
        reason,
        head_len,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_without_auth() {
        let req = encode_connect(&"93.184.216.34:443".parse().unwrap(), None);
        assert_eq!(
            req,
            b"CONNECT 93.184.216.34:443 HTTP/1.1\r\nHost: 93.184.216.34:443\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_connect_with_auth_ipv6() {
        let req = encode_connect(&"[2001:db8::1]:80".parse().unwrap(), Some(("user", "pass")));
        let text = String::from_utf8(req).unwrap();
        assert!(text.starts_with("CONNECT [2001:db8::1]:80 HTTP/1.1\r\n"));
        assert!(text.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_response_incremental() {
        assert_eq!(parse_response_head(b"HTTP/1.1 200 Conn").unwrap(), None);

        let full = b"HTTP/1.1 200 Connection established\r\nVia: x\r\n\r\nEXTRA";
        let head = parse_response_head(full).unwrap().unwrap();
        assert!(head.is_success());
        assert_eq!(head.reason, "Connection established");
        assert_eq!(&full[head.head_len..], b"EXTRA");
    }

    #[test]
    fn test_response_refused() {
        let head = parse_response_head(b"HTTP/1.0 407 Proxy Authentication Required\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(!head.is_success());
        assert!(matches!(
            head.into_result(),
            Err(HandshakeError::Status { status: 407, .. })
        ));

        let head = parse_response_head(b"HTTP/1.1 204\r\n\r\n").unwrap().unwrap();
        assert!(head.into_result().is_err());
    }

    #[test]
    fn test_response_malformed() {
        assert!(matches!(
            parse_response_head(b"SSH-2.0-OpenSSH\r\n\r\n"),
            Err(HandshakeError::Malformed { .. })
        ));
        assert!(matches!(
            parse_response_head(b"HTTP/1.1 abc\r\n\r\n"),
            Err(HandshakeError::Malformed { .. })
        ));
    }

    #[test]
    fn test_response_too_large() {
        let buf = vec![b'a'; MAX_RESPONSE_HEAD];
        assert_eq!(
            parse_response_head(&buf),
            Err(HandshakeError::HeadTooLarge {
                max: MAX_RESPONSE_HEAD
            })
        );
    }
}
