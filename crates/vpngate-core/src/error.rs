// ============================================
// File: crates/vpngate-core/src/error.rs
// ============================================
//! # Core Error Types
//!
//! ## Creation Reason
//! Errors raised by the pure protocol logic: subnet splitting, the
//! management-console parser and the tunnel request codec.
//!
//! ## Error Categories
//! 1. **Addressing**: invalid base network or split mask (not retryable)
//! 2. **Protocol**: unparseable management lines
//! 3. **Tunnel**: missing/malformed CONNECT targets and response heads
//!
//! ## ⚠️ Important Note for Next Developer
//! - Tunnel errors carry peer-supplied text; the server never echoes
//!   `Display` output back to the peer, only fixed status lines
//!
//! ## Last Modified
//! v0.3.0 - Addressing and tunnel codec errors

use thiserror::Error;

use vpngate_common::error::CommonError;

// ============================================
// Result Type Alias
// ============================================

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

// ============================================
// CoreError
// ============================================

/// Core error types for addressing and protocol parsing.
#[derive(Error, Debug)]
pub enum CoreError {
    // ========================================
    // Addressing Errors
    // ========================================

    /// Base network could not be parsed.
    #[error("Invalid network '{network}': {reason}")]
    InvalidNetwork {
        /// Network as given
        network: String,
        /// Parse failure
        reason: String,
    },

    /// Requested split mask is wider than the base network.
    #[error("Cannot split /{base} into /{requested}")]
    MaskWiderThanBase {
        /// Base prefix length
        base: u8,
        /// Requested prefix length
        requested: u8,
    },

    /// Requested split mask leaves fewer than three usable hosts.
    #[error("Mask /{requested} is too small, 3 usable addresses are required")]
    MaskTooNarrow {
        /// Requested prefix length
        requested: u8,
    },

    // ========================================
    // Protocol Errors
    // ========================================

    /// Management line did not match its declared shape.
    #[error("Malformed management line: {reason}")]
    MalformedLine {
        /// What's wrong with the line
        reason: String,
    },

    // ========================================
    // Tunnel Errors
    // ========================================

    /// The request head carried no usable target.
    #[error("Missing tunnel target: {reason}")]
    MissingTarget {
        /// What was missing
        reason: String,
    },

    /// The target host did not match `<hex>.<balena|resin|vpn>[:port]`.
    #[error("Invalid tunnel hostname: {host}")]
    InvalidHostname {
        /// Host as received
        host: String,
    },

    /// A request or response head could not be parsed.
    #[error("Malformed HTTP head: {reason}")]
    MalformedHead {
        /// What's wrong with the head
        reason: String,
    },

    /// Error from the common crate.
    #[error(transparent)]
    Common(#[from] CommonError),
}

impl CoreError {
    /// Creates an `InvalidNetwork` error.
    pub fn invalid_network(network: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidNetwork {
            network: network.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `MalformedLine` error.
    pub fn malformed_line(reason: impl Into<String>) -> Self {
        Self::MalformedLine {
            reason: reason.into(),
        }
    }

    /// Creates a `MissingTarget` error.
    pub fn missing_target(reason: impl Into<String>) -> Self {
        Self::MissingTarget {
            reason: reason.into(),
        }
    }

    /// Creates an `InvalidHostname` error.
    pub fn invalid_hostname(host: impl Into<String>) -> Self {
        Self::InvalidHostname { host: host.into() }
    }

    /// Creates a `MalformedHead` error.
    pub fn malformed_head(reason: impl Into<String>) -> Self {
        Self::MalformedHead {
            reason: reason.into(),
        }
    }

    /// Returns `true` for configuration mistakes that retrying cannot fix.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidNetwork { .. } | Self::MaskWiderThanBase { .. } | Self::MaskTooNarrow { .. }
        )
    }

    /// Returns `true` for errors caused by what a tunnel client sent.
    #[must_use]
    pub const fn is_tunnel_request_error(&self) -> bool {
        matches!(
            self,
            Self::MissingTarget { .. } | Self::InvalidHostname { .. } | Self::MalformedHead { .. }
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
    fn test_error_display() {
        let err = CoreError::MaskWiderThanBase {
            base: 16,
            requested: 8,
        };
        assert_eq!(err.to_string(), "Cannot split /16 into /8");
    }

    #[test]
    fn test_error_classification() {
        assert!(CoreError::MaskTooNarrow { requested: 30 }.is_config_error());
        assert!(CoreError::invalid_hostname("x.com").is_tunnel_request_error());
        assert!(!CoreError::malformed_line("x").is_config_error());
    }
}
