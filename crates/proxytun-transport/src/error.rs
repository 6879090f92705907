// ============================================
// File: crates/proxytun-transport/src/error.rs
// ============================================
//! # Transport Error Types
//!
//! ## Creation Reason
//! The engine decides between retrying a TUN read and shutting down based
//! on the error alone, so the classification lives next to the errors.
//!
//! ## Error Categories
//! 1. **TUN Errors**: device creation, configuration, read/write
//! 2. **Configuration Errors**: invalid names, MTU, routes
//! 3. **System Errors**: permissions and raw I/O
//!
//! ## ⚠️ Important Note for Next Developer
//! - Read/write failures keep the `io::ErrorKind`; `is_retryable` needs it
//!
//! ## Last Modified
//! v0.1.0 - Initial error definitions

use std::io;

use thiserror::Error;

use proxytun_common::CommonError;

// ============================================
// Result Type Alias
// ============================================

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

// ============================================
// TransportError
// ============================================

/// Transport layer error types.
#[derive(Error, Debug)]
pub enum TransportError {
    // ========================================
    // TUN Device Errors
    // ========================================

    /// Failed to create TUN device.
    #[error("Failed to create TUN device '{name}': {reason}")]
    TunCreateFailed {
        /// Requested device name
        name: String,
        /// Why creation failed
        reason: String,
    },

    /// Failed to configure TUN device.
    #[error("Failed to configure TUN device '{name}': {reason}")]
    TunConfigFailed {
        /// Device name
        name: String,
        /// Why configuration failed
        reason: String,
    },

    /// Device has been closed; no further reads will succeed.
    #[error("TUN device '{name}' is closed")]
    DeviceClosed {
        /// Device name
        name: String,
    },

    // ========================================
    // Configuration Errors
    // ========================================

    /// Invalid configuration.
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig {
        /// Configuration field name
        field: String,
        /// Why it's invalid
        reason: String,
    },

    // ========================================
    // System Errors
    // ========================================

    /// Permission denied for operation.
    #[error("Permission denied: {operation}")]
    PermissionDenied {
        /// What operation was denied
        operation: String,
    },

    /// I/O error from the system.
    #[error("I/O error: {context}")]
    Io {
        /// What was happening when the error occurred
        context: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Error from common crate.
    #[error(transparent)]
    Common(#[from] CommonError),
}

impl TransportError {
    // ========================================
    // Convenience Constructors
    // ========================================

    /// Creates a `TunCreateFailed` error.
    pub fn tun_create_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TunCreateFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `TunConfigFailed` error.
    pub fn tun_config_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TunConfigFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `Io` error with context.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates an `InvalidConfig` error.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    // ========================================
    // Error Classification
    // ========================================

    /// Returns `true` if this error is transient and the operation may be
    /// retried (`Interrupted`, `WouldBlock`, `TimedOut`).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns `true` if this error requires elevated privileges.
    #[must_use]
    pub const fn requires_privileges(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. } | Self::TunCreateFailed { .. }
        )
    }
}

// ============================================
// Error Conversions
// ============================================

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            context: "unspecified I/O operation".into(),
            source: err,
        }
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::tun_create_failed("tun0", "busy");
        assert!(err.to_string().contains("tun0"));
        assert!(err.requires_privileges());
    }

    #[test]
    fn test_retryable_kinds() {
        for kind in [
            io::ErrorKind::Interrupted,
            io::ErrorKind::WouldBlock,
            io::ErrorKind::TimedOut,
        ] {
            assert!(TransportError::io("read", io::Error::from(kind)).is_retryable());
        }
        assert!(!TransportError::io("read", io::Error::from(io::ErrorKind::BrokenPipe)).is_retryable());
        assert!(!TransportError::DeviceClosed { name: "tun0".into() }.is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: TransportError = io::Error::from(io::ErrorKind::Interrupted).into();
        assert!(err.is_retryable());
    }
}
