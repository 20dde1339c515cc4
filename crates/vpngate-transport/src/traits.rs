// ============================================
// File: crates/vpngate-transport/src/traits.rs
// ============================================
//! # Transport Traits
//!
//! ## Creation Reason
//! The drain coordinator and the worker startup path talk to the local
//! load balancer through a trait so both can be tested without a live
//! HAProxy socket.
//!
//! ## Main Functionality
//! - `LoadBalancer`: register a backend address and flip its state
//! - `BackendState`: admission state of one backend server
//!
//! ## ⚠️ Important Note for Next Developer
//! - Implementations must be Send + Sync; they are shared via `Arc<dyn _>`
//! - Server names are already fully qualified (`<backend>/<server>`)
//!
//! ## Last Modified
//! v0.3.0 - Load balancer control trait

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;

// ============================================
// BackendState
// ============================================

/// Admission state of a load-balancer backend server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendState {
    /// Accepts new sessions.
    Ready,
    /// Keeps existing sessions, admits no new ones.
    Drain,
}

impl BackendState {
    /// Keyword used on the HAProxy runtime API.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Drain => "drain",
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================
// LoadBalancer Trait
// ============================================

/// Control interface of the local load balancer.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Points `server` at `host:port` and marks it ready.
    async fn register(&self, server: &str, host: &str, port: u16) -> Result<()>;

    /// Changes the admission state of `server`.
    async fn set_state(&self, server: &str, state: BackendState) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_state_keywords() {
        assert_eq!(BackendState::Ready.to_string(), "ready");
        assert_eq!(BackendState::Drain.as_str(), "drain");
    }
}
