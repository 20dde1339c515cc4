// ============================================
// File: crates/vpngate-server/src/services/mod.rs
// ============================================
//! # Gateway Services
//!
//! ## Creation Reason
//! Business logic of a gateway worker, separated from the control-plane
//! client and the raw transports.
//!
//! ## Main Functionality
//!
//! ### Submodules
//! - [`vpn`]: OpenVPN process lifecycle and console commands
//! - [`session`]: client id → device sessions and traffic accounting
//! - [`drain`]: paced disconnects on shutdown
//! - [`tunnel`]: CONNECT tunnel routing between gateways
//!
//! ## Service Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Gateway worker                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐ events ┌──────────────┐                   │
//! │  │  VpnManager  │───────►│ClientSessions│──► reconciler     │
//! │  └──────┬───────┘        └──────┬───────┘                   │
//! │         │ kill                  │ uuids                     │
//! │  ┌──────▼───────────────────────▼──────┐                    │
//! │  │         DrainCoordinator            │──► load balancer   │
//! │  └─────────────────────────────────────┘                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │                    Proxy worker                             │
//! │  ┌──────────────┐  lookups  ┌──────────────┐                │
//! │  │ TunnelRouter │──────────►│DeviceDirectory│               │
//! │  └──────────────┘           └──────────────┘                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Collaborators are trait objects so each service is testable alone
//!
//! ## Last Modified
//! v0.3.0 - VPN, session, drain and tunnel services

pub mod drain;
pub mod session;
pub mod tunnel;
pub mod vpn;

// Re-export primary types
pub use drain::{ClientDisconnector, DrainCoordinator, DrainPolicy, DrainReport};
pub use session::{ClientSession, ClientSessions, TrafficSample, TrafficTotals};
pub use tunnel::{LocalResolver, Route, SystemResolver, TunnelRouter, TunnelSettings};
pub use vpn::{VpnInstanceSpec, VpnManager, VpnState};
