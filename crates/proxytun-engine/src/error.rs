// ============================================
// File: crates/proxytun-engine/src/error.rs
// ============================================
//! # Engine Error Types
//!
//! ## Creation Reason
//! Separates the three scopes a failure can have: the whole engine, one
//! flow's proxy connection, or one packet's flow lookup.
//!
//! ## Main Functionality
//! - `EngineError`: lifecycle and configuration failures
//! - `ConnectError`: proxy connection failures (the flow fails)
//! - `FlowTableError`: lookup/creation refusals (the packet is dropped)
//!
//! ## ⚠️ Important Note for Next Developer
//! - Only TUN device failures escalate to `EngineError::Fatal`
//! - `ConnectError` messages may name the proxy but never credentials
//!
//! ## Last Modified
//! v0.1.0 - Initial error definitions

use thiserror::Error;

use proxytun_common::{CommonError, FlowKey};
use proxytun_core::HandshakeError;
use proxytun_transport::TransportError;

// ============================================
// Result Type Alias
// ============================================

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

// ============================================
// EngineError
// ============================================

/// Engine lifecycle errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration file could not be read or parsed.
    #[error("Failed to load configuration from '{path}': {reason}")]
    ConfigLoad {
        /// Path of the configuration file
        path: String,
        /// Why loading failed
        reason: String,
    },

    /// Configuration value is invalid.
    #[error("Invalid configuration: {field} - {reason}")]
    ConfigInvalid {
        /// Configuration field name
        field: String,
        /// Why it's invalid
        reason: String,
    },

    /// `start` called while a run is active.
    #[error("Engine is already running")]
    AlreadyRunning,

    /// The TUN device failed in a way the engine cannot recover from.
    #[error("Engine stopped after fatal error: {reason}")]
    Fatal {
        /// What failed
        reason: String,
    },

    /// Error from the TUN device.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Error from common crate.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Creates a `ConfigLoad` error.
    pub fn config_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `ConfigInvalid` error.
    pub fn config_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `Fatal` error.
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    /// Returns `true` for configuration errors.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigLoad { .. } | Self::ConfigInvalid { .. })
    }

    /// Returns `true` if the engine cannot continue.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. } | Self::ConfigLoad { .. })
    }
}

// ============================================
// ConnectError
// ============================================

/// Failure to obtain a relayed connection from the proxy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Proxy could not be reached (resolution, connect, or timeout).
    #[error("Proxy {proxy} unreachable: {reason}")]
    Unreachable {
        /// `host:port` of the proxy
        proxy: String,
        /// Why it could not be reached
        reason: String,
    },

    /// Proxy answered but refused or broke the handshake.
    #[error("Proxy rejected connection: {reason}")]
    ProxyRejected {
        /// What the proxy did
        reason: String,
    },

    /// The proxy type cannot carry this kind of flow.
    #[error("Unsupported through this proxy: {reason}")]
    Unsupported {
        /// What is unsupported
        reason: String,
    },
}

impl ConnectError {
    /// Creates an `Unreachable` error.
    pub fn unreachable(proxy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unreachable {
            proxy: proxy.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `ProxyRejected` error.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::ProxyRejected {
            reason: reason.into(),
        }
    }

    /// Creates an `Unsupported` error.
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the proxy itself could not be reached.
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

impl From<HandshakeError> for ConnectError {
    fn from(err: HandshakeError) -> Self {
        Self::rejected(err.to_string())
    }
}

// ============================================
// FlowTableError
// ============================================

/// Reasons a packet could not be mapped to a flow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowTableError {
    /// Table is at capacity.
    #[error("Flow table exhausted: max {limit} flows")]
    Exhausted {
        /// Configured capacity
        limit: usize,
    },

    /// No flow exists and the packet may not open one.
    #[error("No flow for {key}")]
    NoFlow {
        /// Key of the orphan packet
        key: FlowKey,
    },
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::config_load("/etc/proxytun.toml", "file not found");
        assert!(err.to_string().contains("/etc/proxytun.toml"));
        assert!(err.is_config_error());
        assert!(err.is_fatal());
        assert!(!EngineError::AlreadyRunning.is_fatal());
    }

    #[test]
    fn test_handshake_conversion() {
        let err: ConnectError = HandshakeError::Status {
            status: 403,
            reason: "Forbidden".into(),
        }
        .into();
        assert!(matches!(err, ConnectError::ProxyRejected { .. }));
        assert!(err.to_string().contains("403"));
        assert!(!err.is_unreachable());
        assert!(ConnectError::unreachable("proxy:8080", "refused").is_unreachable());
    }
}
