// ============================================
// File: crates/vpngate-server/src/management/mod.rs
// ============================================
//! # Control Plane Module
//!
//! ## Creation Reason
//! Everything the gateway says to, or asks of, the control-plane API:
//! device state reports, device directory lookups, client
//! authentication and service instance registration.
//!
//! ## Main Functionality
//! - `ControlPlaneClient`: HTTP client implementing the collaborator traits
//! - `DeviceStateReconciler`: batched, retrying device state sync
//! - `HeartbeatReporter`: periodic service instance liveness
//! - `ErrorReporter`: error-tracking seam
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Control Plane Module                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐  │
//! │  │ Reconciler   │  │  Heartbeat   │  │  TunnelRouter    │  │
//! │  │ (batched)    │  │  Reporter    │  │  (services)      │  │
//! │  └──────┬───────┘  └──────┬───────┘  └────────┬─────────┘  │
//! │         │ ControlPlane    │                    │ Directory  │
//! │         └─────────────────┼────────────────────┘            │
//! │                           ▼                                 │
//! │                ┌────────────────────┐                       │
//! │                │ ControlPlaneClient │                       │
//! │                │ (HTTP + bearer)    │                       │
//! │                └─────────┬──────────┘                       │
//! │                          │                                  │
//! └──────────────────────────┼──────────────────────────────────┘
//!                            ▼
//!                    Control-plane API
//! ```
//!
//! ## Last Modified
//! v0.3.0 - Control-plane client, reconciler and heartbeat

pub mod client;
pub mod config;
pub mod heartbeat;
pub mod models;
pub mod reconciler;
pub mod reporting;

pub use client::{ClientAuthenticator, ControlPlane, ControlPlaneClient, DeviceDirectory};
pub use config::ControlPlaneConfig;
pub use heartbeat::HeartbeatReporter;
pub use reconciler::{DeviceStateEntry, DeviceStateReconciler};
pub use reporting::{ErrorReporter, TracingErrorReporter};
