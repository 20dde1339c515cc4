// ============================================
// File: crates/vpngate-server/src/management/reporting.rs
// ============================================
//! # Error Reporting
//!
//! Unexpected failures are handed to an error-tracking collaborator
//! together with a stable fingerprint, so repeated occurrences group
//! together. The default reporter writes them to the log.

use std::error::Error;

use tracing::error;

/// Fingerprint for failed device-state batches.
pub const DEVICE_STATE_UPDATE_ERROR: &str = "device-state-update-error";

/// Fingerprint for unexpected tunnel failures.
pub const TUNNEL_ERROR: &str = "tunnel-error";

/// Error-tracking collaborator.
pub trait ErrorReporter: Send + Sync {
    /// Records `error` under `fingerprint` with key/value context.
    fn capture(&self, error: &dyn Error, fingerprint: &str, context: &[(&str, String)]);
}

/// Reporter that logs at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn capture(&self, error: &dyn Error, fingerprint: &str, context: &[(&str, String)]) {
        let context = context
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        let mut chain = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push_str(": ");
            chain.push_str(&cause.to_string());
            source = cause.source();
        }
        error!(fingerprint, context = %context, "{}", chain);
    }
}
