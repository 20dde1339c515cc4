// ============================================
// File: crates/vpngate-transport/src/error.rs
// ============================================
//! # Transport Error Types
//!
//! ## Creation Reason
//! Defines error types for the OS-facing side of the gateway: the
//! OpenVPN subprocess, its management socket and the load-balancer
//! control socket.
//!
//! ## Main Functionality
//! - `TransportError`: Primary error enum for transport operations
//! - Categorization of startup-fatal vs retryable errors
//!
//! ## Error Categories
//! 1. **Process Errors**: orphan reaping, spawn, startup probe
//! 2. **Console Errors**: command failures, closed console
//! 3. **Socket Errors**: connect failures, load-balancer socket
//!
//! ## ⚠️ Important Note for Next Developer
//! - Startup errors are fatal to the worker; the external supervisor
//!   restarts it. Never add an in-process restart loop on top
//! - `CommandFailed` keeps OpenVPN's literal `ERROR:` line for logs
//!
//! ## Last Modified
//! v0.3.0 - Process, console and socket errors

use std::io;

use thiserror::Error;

use vpngate_common::error::CommonError;

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
    // Process Errors
    // ========================================

    /// A process from a previous run kept answering signal probes after
    /// both SIGTERM and SIGKILL.
    #[error("Orphan process {pid} from '{pid_file}' survived SIGTERM and SIGKILL")]
    OrphanSurvived {
        /// Pid read from the pid file
        pid: i32,
        /// Pid file path
        pid_file: String,
    },

    /// Sending a signal failed for a reason other than "no such process".
    #[error("Failed to signal process {pid}: {reason}")]
    SignalFailed {
        /// Target pid
        pid: i32,
        /// Errno description
        reason: String,
    },

    /// The subprocess could not be spawned.
    #[error("Failed to spawn '{program}': {reason}")]
    SpawnFailed {
        /// Program path
        program: String,
        /// Why spawning failed
        reason: String,
    },

    /// The management port did not accept a connection in time.
    #[error("Management port {addr} not ready after {waited_ms}ms")]
    StartupTimeout {
        /// Probed address
        addr: String,
        /// Budget that was exhausted
        waited_ms: u64,
    },

    // ========================================
    // Console Errors
    // ========================================

    /// OpenVPN answered a command with `ERROR:`.
    #[error("Management command '{command}' failed: {response}")]
    CommandFailed {
        /// Command as sent
        command: String,
        /// Literal response line
        response: String,
    },

    /// The management connection closed.
    #[error("Management console closed")]
    ConsoleClosed,

    /// A command was issued before the console was connected.
    #[error("Management console not connected")]
    NotConnected,

    // ========================================
    // Socket Errors
    // ========================================

    /// Connecting a socket failed.
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed {
        /// Target address or socket path
        addr: String,
        /// Why connecting failed
        reason: String,
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

    /// Creates a `SpawnFailed` error.
    pub fn spawn_failed(program: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            program: program.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `ConnectFailed` error.
    pub fn connect_failed(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `CommandFailed` error.
    pub fn command_failed(command: impl Into<String>, response: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            response: response.into(),
        }
    }

    /// Creates an `Io` error with context.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    // ========================================
    // Error Classification
    // ========================================

    /// Returns `true` if this error is transient and retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectFailed { .. } => true,
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
            ),
            _ => false,
        }
    }

    /// Returns `true` if this error happened while bringing OpenVPN up.
    #[must_use]
    pub const fn is_startup_error(&self) -> bool {
        matches!(
            self,
            Self::OrphanSurvived { .. }
                | Self::SignalFailed { .. }
                | Self::SpawnFailed { .. }
                | Self::StartupTimeout { .. }
        )
    }

    /// Returns `true` if the management console is unusable.
    #[must_use]
    pub const fn is_console_error(&self) -> bool {
        matches!(self, Self::ConsoleClosed | Self::NotConnected)
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
