// ============================================
// File: crates/proxytun-common/src/error.rs
// ============================================
//! # Common Error Types
//!
//! ## Creation Reason
//! Errors raised while parsing the shared types from text (config files,
//! CLI arguments).
//!
//! ## Last Modified
//! v0.1.0 - Initial error definitions

use thiserror::Error;

/// Common result type.
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors shared across proxytun crates.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// Invalid input data provided.
    #[error("Invalid input for '{field}': {reason}")]
    InvalidInput {
        /// Name of the field or parameter
        field: String,
        /// Description of what's wrong
        reason: String,
    },

    /// Value is out of acceptable range.
    #[error("Value out of range: {value} not in [{min}, {max}]")]
    OutOfRange {
        /// The value that was out of range
        value: String,
        /// Minimum acceptable value
        min: String,
        /// Maximum acceptable value
        max: String,
    },
}

impl CommonError {
    /// Creates an `InvalidInput` error.
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `OutOfRange` error.
    pub fn out_of_range(
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
    ) -> Self {
        Self::OutOfRange {
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CommonError::invalid_input("proxy.type", "unknown kind");
        assert!(err.to_string().contains("proxy.type"));

        let err = CommonError::out_of_range(70000, 1, 65535);
        assert!(err.to_string().contains("70000"));
        assert!(err.to_string().contains("65535"));
    }
}
