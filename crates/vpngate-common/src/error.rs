// ============================================
// File: crates/vpngate-common/src/error.rs
// ============================================
//! # Common Error Types
//!
//! ## Creation Reason
//! Base error enum shared by every vpngate crate. The core, transport
//! and server crates wrap it with `#[from]` so identifier parsing failures
//! propagate with `?`.
//!
//! ## Main Functionality
//! - `CommonError`: identifier validation and range failures
//! - `Result<T>`: alias over `CommonError`
//!
//! ## ⚠️ Important Note for Next Developer
//! - Error text may be logged but is never sent to tunnel peers; the
//!   server maps errors to fixed status lines before replying
//!
//! ## Last Modified
//! v0.3.0 - Trimmed to the variants the gateway uses

use thiserror::Error;

// ============================================
// Result Type Alias
// ============================================

/// Common result type for operations that may fail.
pub type Result<T> = std::result::Result<T, CommonError>;

// ============================================
// CommonError
// ============================================

/// Common error types shared across vpngate crates.
///
/// # Example
/// ```
/// use vpngate_common::error::{CommonError, Result};
///
/// fn require_hex(value: &str) -> Result<()> {
///     if !value.chars().all(|c| c.is_ascii_hexdigit()) {
///         return Err(CommonError::invalid_input("uuid", "must be hexadecimal"));
///     }
///     Ok(())
/// }
///
/// assert!(require_hex("deadbeef").is_ok());
/// assert!(require_hex("nope").is_err());
/// ```
#[derive(Error, Debug)]
pub enum CommonError {
    /// Input failed validation.
    #[error("Invalid input for '{field}': {reason}")]
    InvalidInput {
        /// Field or parameter name
        field: String,
        /// Why validation failed
        reason: String,
    },

    /// Numeric value outside its allowed range.
    #[error("Value {value} out of range [{min}, {max}] for '{field}'")]
    OutOfRange {
        /// Field name
        field: String,
        /// Offending value
        value: i64,
        /// Lower bound (inclusive)
        min: i64,
        /// Upper bound (inclusive)
        max: i64,
    },
}

impl CommonError {
    // ========================================
    // Convenience Constructors
    // ========================================

    /// Creates an `InvalidInput` error.
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `OutOfRange` error.
    pub fn out_of_range(field: impl Into<String>, value: i64, min: i64, max: i64) -> Self {
        Self::OutOfRange {
            field: field.into(),
            value,
            min,
            max,
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
        let err = CommonError::invalid_input("uuid", "must be hexadecimal");
        assert!(err.to_string().contains("uuid"));
        assert!(err.to_string().contains("hexadecimal"));
    }

    #[test]
    fn test_out_of_range_display() {
        let err = CommonError::out_of_range("instance", 0, 1, 1024);
        assert_eq!(err.to_string(), "Value 0 out of range [1, 1024] for 'instance'");
    }
}
