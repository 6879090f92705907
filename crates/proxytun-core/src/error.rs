// ============================================
// File: crates/proxytun-core/src/error.rs
// ============================================
//! # Core Error Types
//!
//! ## Creation Reason
//! Separates the two ways bytes can be wrong: an IP packet read from the
//! TUN device, or a reply from the upstream proxy.
//!
//! ## Main Functionality
//! - `ParseError`: packet could not be turned into a [`crate::Packet`]
//! - `HandshakeError`: proxy spoke something other than the expected protocol
//!
//! ## Error Categories
//! 1. **Parse Errors**: always per-packet, the packet is dropped
//! 2. **Handshake Errors**: always per-flow, the flow fails
//!
//! ## ⚠️ Important Note for Next Developer
//! - Never include credentials in a `HandshakeError` message
//!
//! ## Last Modified
//! v0.1.0 - Initial error definitions

use thiserror::Error;

// ============================================
// Result Type Alias
// ============================================

/// Result type for packet parsing.
pub type Result<T> = std::result::Result<T, ParseError>;

// ============================================
// ParseError
// ============================================

/// Reasons an IP packet cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Buffer ends before a header or declared length.
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Header fields are inconsistent with each other.
    #[error("Malformed packet: {reason}")]
    Malformed {
        /// What is inconsistent
        reason: String,
    },

    /// Well-formed but outside what the tunnel handles.
    #[error("Unsupported packet: {reason}")]
    Unsupported {
        /// What is unsupported
        reason: String,
    },
}

impl ParseError {
    /// Creates a `TooShort` error.
    #[must_use]
    pub const fn too_short(expected: usize, actual: usize) -> Self {
        Self::TooShort { expected, actual }
    }

    /// Creates a `Malformed` error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    /// Creates an `Unsupported` error.
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the packet was valid IP the tunnel chooses to skip.
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

// ============================================
// HandshakeError
// ============================================

/// Protocol violations or refusals during a proxy handshake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Reply bytes do not follow the protocol.
    #[error("Malformed proxy reply: {reason}")]
    Malformed {
        /// What is wrong with the reply
        reason: String,
    },

    /// HTTP response head grew past the allowed size.
    #[error("Proxy response head exceeds {max} bytes")]
    HeadTooLarge {
        /// Maximum head size
        max: usize,
    },

    /// HTTP proxy answered with a status other than 200.
    #[error("Proxy refused CONNECT: {status} {reason}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Reason phrase
        reason: String,
    },

    /// SOCKS server accepted none of the offered methods.
    #[error("No acceptable SOCKS authentication method")]
    NoAcceptableMethod,

    /// SOCKS username/password sub-negotiation failed.
    #[error("SOCKS authentication rejected (status 0x{0:02x})")]
    AuthRejected(u8),

    /// SOCKS server replied with a failure code.
    #[error("SOCKS request failed: {message} (0x{code:02x})")]
    Reply {
        /// RFC 1928 reply code
        code: u8,
        /// Human-readable meaning
        message: &'static str,
    },

    /// Request cannot be expressed in the wire format.
    #[error("Invalid proxy request: {reason}")]
    InvalidRequest {
        /// Why the request is invalid
        reason: String,
    },
}

impl HandshakeError {
    /// Creates a `Malformed` error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    /// Creates an `InvalidRequest` error.
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the proxy understood the request and refused it.
    #[must_use]
    pub const fn is_refusal(&self) -> bool {
        matches!(
            self,
            Self::Status { .. } | Self::NoAcceptableMethod | Self::AuthRejected(_) | Self::Reply { .. }
        )
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::too_short(20, 7);
        assert!(err.to_string().contains("20"));
        assert!(err.to_string().contains('7'));
        assert!(ParseError::unsupported("icmp").is_unsupported());
        assert!(!ParseError::malformed("ihl").is_unsupported());
    }

    #[test]
    fn test_handshake_classification() {
        let err = HandshakeError::Status {
            status: 407,
            reason: "Proxy Authentication Required".into(),
        };
        assert!(err.is_refusal());
        assert!(err.to_string().contains("407"));
        assert!(!HandshakeError::malformed("garbage").is_refusal());
        assert!(!HandshakeError::HeadTooLarge { max: 8192 }.is_refusal());
    }
}
