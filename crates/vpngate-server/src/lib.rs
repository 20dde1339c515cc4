// ============================================
// File: crates/vpngate-server/src/lib.rs
// ============================================
//! # vpngate Server Library
//!
//! ## Creation Reason
//! Implements the worker processes of a multi-instance OpenVPN gateway:
//! supervising OpenVPN, reporting device connection state to the control
//! plane, and proxying CONNECT tunnels to whichever gateway holds a
//! device's session.
//!
//! ## Main Functionality
//!
//! ### Modules
//! - [`config`]: TOML configuration
//! - [`management`]: control-plane client, state reconciler, heartbeat
//! - [`services`]: VPN manager, sessions, drain, tunnel router
//! - [`server`]: gateway and proxy worker orchestration
//! - [`error`]: server and tunnel error types
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        vpngate host                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐        ┌───────────────┐   │
//! │  │ gateway #1   │  │ gateway #N   │  ...   │ proxy workers │   │
//! │  │  OpenVPN     │  │  OpenVPN     │        │ :3128 / :3127 │   │
//! │  └──────┬───────┘  └──────┬───────┘        └───────┬───────┘   │
//! │         │ connect/disconnect                        │ lookups   │
//! │         ▼                 ▼                         ▼           │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │                 control-plane API                        │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                                                                 │
//! │  HAProxy ──► gateway VPN ports        peer gateways ◄──► :3127  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Every worker is its own OS process; nothing is shared in memory
//! - Configuration changes require restart (no hot-reload)
//!
//! ## Last Modified
//! v0.3.0 - Gateway, reconciler and tunnel proxy

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod management;
pub mod server;
pub mod services;

// Re-export primary types
pub use config::GatewayConfig;
pub use error::{Result, ServerError, TunnelError};
pub use management::ControlPlaneClient;
pub use server::{GatewayWorker, ProxyWorker};
