// ============================================
// File: crates/vpngate-server/src/error.rs
// ============================================
//! # Server Error Types
//!
//! ## Main Functionality
//! - `ServerError`: worker-level failures (config, startup, API, I/O)
//! - `TunnelError`: per-request tunnel failures and their status lines
//!
//! ## ⚠️ Important Note for Next Developer
//! - `TunnelError` text goes to logs and the error reporter only. The
//!   peer receives nothing but the fixed line for `status_code()`
//!
//! ## Last Modified
//! v0.3.0 - Gateway and tunnel error kinds

use thiserror::Error;

use vpngate_common::error::CommonError;
use vpngate_common::DeviceUuid;
use vpngate_core::error::CoreError;
use vpngate_transport::error::TransportError;

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

// ============================================
// ServerError
// ============================================

/// Server error types.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration file could not be read or parsed.
    #[error("Failed to load configuration from '{path}': {reason}")]
    ConfigLoad {
        /// File path
        path: String,
        /// Why loading failed
        reason: String,
    },

    /// A configuration value is invalid.
    #[error("Invalid configuration: {field} - {reason}")]
    ConfigInvalid {
        /// Dotted field name
        field: String,
        /// What's wrong with it
        reason: String,
    },

    /// OpenVPN could not be brought up (orphan reap, spawn or probe).
    #[error("VPN process startup failed: {reason}")]
    ProcessStartupFailure {
        /// What failed
        reason: String,
    },

    /// The OpenVPN process went away while the worker was running.
    #[error("VPN process {status}")]
    ProcessExited {
        /// Exit description
        status: String,
    },

    /// The VPN manager was asked to do something its lifecycle forbids.
    #[error("VPN manager is {actual}, expected {expected}")]
    InvalidState {
        /// Required state
        expected: &'static str,
        /// Current state
        actual: &'static str,
    },

    /// A control-plane call failed.
    #[error("Control plane {operation} failed: {reason}")]
    UpstreamApi {
        /// Which call
        operation: String,
        /// Transport error or unexpected status
        reason: String,
        /// HTTP status, if a response arrived
        status: Option<u16>,
    },

    /// Unexpected internal failure.
    #[error("Internal error: {message}")]
    Internal {
        /// Description
        message: String,
    },

    /// Error from the common crate.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Error from the core crate.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Error from the transport crate.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
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

    /// Creates a `ProcessStartupFailure` error.
    pub fn startup_failed(reason: impl Into<String>) -> Self {
        Self::ProcessStartupFailure {
            reason: reason.into(),
        }
    }

    /// Creates an `UpstreamApi` error without a response status.
    pub fn upstream(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamApi {
            operation: operation.into(),
            reason: reason.into(),
            status: None,
        }
    }

    /// Creates an `UpstreamApi` error for an unexpected response status.
    pub fn upstream_status(operation: impl Into<String>, status: u16) -> Self {
        Self::UpstreamApi {
            operation: operation.into(),
            reason: format!("status code was '{status}', expected '200'"),
            status: Some(status),
        }
    }

    /// Creates an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` for configuration errors.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigLoad { .. } | Self::ConfigInvalid { .. })
    }

    /// Returns `true` if the worker must exit non-zero.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::ConfigLoad { .. }
            | Self::ConfigInvalid { .. }
            | Self::ProcessStartupFailure { .. }
            | Self::ProcessExited { .. } => true,
            Self::Core(e) => e.is_config_error(),
            Self::Transport(e) => e.is_startup_error(),
            _ => false,
        }
    }

    /// Returns `true` if retrying later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UpstreamApi { status, .. } => status.map_or(true, |s| s >= 500 || s == 429),
            Self::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }
}

// ============================================
// TunnelError
// ============================================

/// Why a tunnel request was not established.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Empty request or no target.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Target did not match the tunnel hostname pattern.
    #[error("Invalid hostname: {0}")]
    InvalidHostname(String),

    /// Device directory has no such uuid.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceUuid),

    /// Credential does not grant the tunnel permission.
    #[error("Device not accessible: {0}")]
    AccessDenied(DeviceUuid),

    /// Device is not connected to the VPN.
    #[error("Device not available: {0}")]
    DeviceUnavailable(DeviceUuid),

    /// No service instance manages the device.
    #[error("Service instance not found for device {0}")]
    ServiceInstanceNotFound(DeviceUuid),

    /// Registry points at this instance although the device is not local.
    #[error("Device {0} is not available on registered service instance")]
    SelfForwardDetected(DeviceUuid),

    /// The Forwarded chain already holds this instance's signature.
    #[error("Loop detected forwarding tunnel request for {0}")]
    LoopDetected(DeviceUuid),

    /// The peer instance failed to establish the tunnel.
    #[error("Remote tunnelling failed: {0}")]
    RemoteTunneling(String),

    /// A control-plane call failed.
    #[error("Invalid response from API: {0}")]
    UpstreamApi(String),

    /// Anything else.
    #[error("Internal tunnel error: {0}")]
    Internal(String),
}

impl TunnelError {
    /// Status code sent to the peer.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::InvalidHostname(_) => 403,
            Self::DeviceNotFound(_) => 404,
            Self::AccessDenied(_) => 407,
            Self::DeviceUnavailable(_) => 503,
            Self::ServiceInstanceNotFound(_)
            | Self::SelfForwardDetected(_)
            | Self::LoopDetected(_)
            | Self::RemoteTunneling(_)
            | Self::UpstreamApi(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Returns `true` for expected outcomes that are only logged.
    #[must_use]
    pub const fn is_handled(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }
}

impl From<CoreError> for TunnelError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::MissingTarget { reason } | CoreError::MalformedHead { reason } => {
                Self::BadRequest(reason)
            }
            CoreError::InvalidHostname { host } => Self::InvalidHostname(host),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<ServerError> for TunnelError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::UpstreamApi { .. } => Self::UpstreamApi(err.to_string()),
            other => Self::Internal(other.to_string()),
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
        let err = ServerError::config_load("/etc/vpngate.toml", "file not found");
        assert!(err.to_string().contains("/etc/vpngate.toml"));
    }

    #[test]
    fn test_error_classification() {
        let config_err = ServerError::config_invalid("vpn.base_port", "must be > 0");
        assert!(config_err.is_config_error());
        assert!(config_err.is_fatal());

        assert!(ServerError::startup_failed("orphan survived").is_fatal());
        assert!(ServerError::upstream("client-connect", "timeout").is_retryable());
        assert!(!ServerError::upstream_status("client-connect", 401).is_retryable());
        assert!(ServerError::upstream_status("client-connect", 502).is_retryable());
    }

    #[test]
    fn test_tunnel_status_codes() {
        let uuid = DeviceUuid::new("deadbeef").unwrap();
        assert_eq!(TunnelError::BadRequest(String::new()).status_code(), 400);
        assert_eq!(TunnelError::InvalidHostname("x".into()).status_code(), 403);
        assert_eq!(TunnelError::DeviceNotFound(uuid.clone()).status_code(), 404);
        assert_eq!(TunnelError::AccessDenied(uuid.clone()).status_code(), 407);
        assert_eq!(TunnelError::DeviceUnavailable(uuid.clone()).status_code(), 503);
        assert_eq!(TunnelError::LoopDetected(uuid.clone()).status_code(), 500);
        assert_eq!(TunnelError::SelfForwardDetected(uuid).status_code(), 500);
        assert!(!TunnelError::Internal("boom".into()).is_handled());
    }

    #[test]
    fn test_core_error_mapping() {
        let err: TunnelError = CoreError::invalid_hostname("example.com").into();
        assert_eq!(err.status_code(), 403);
        let err: TunnelError = CoreError::missing_target("empty").into();
        assert_eq!(err.status_code(), 400);
        let err: TunnelError = ServerError::upstream("device lookup", "timeout").into();
        assert!(matches!(err, TunnelError::UpstreamApi(_)));
    }
}
