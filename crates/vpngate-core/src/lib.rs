// ============================================
// File: crates/vpngate-core/src/lib.rs
// ============================================
//! # vpngate Core - Addressing & Protocol Library
//!
//! ## Creation Reason
//! Holds the logic of the gateway that needs no sockets or processes,
//! so it can be tested byte-for-byte.
//!
//! ## Main Functionality
//!
//! ### Subnet Module ([`subnet`])
//! - Splits the base client network into per-instance blocks
//! - Exposes gateway/pool addresses for OpenVPN arguments
//!
//! ### Protocol Module ([`protocol`])
//! - Management console line parser (`>LOG`, `>CLIENT`, `>BYTECOUNT_CLI`)
//! - Tunnel CONNECT codec and `Forwarded` loop detection chain
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              vpngate-server                         │
//! │                    │                                │
//! │         ┌──────────┴──────────┐                    │
//! │         ▼                     ▼                    │
//! │   vpngate-core  ◄──     vpngate-transport          │
//! │   You are here        │                            │
//! │         │             │                            │
//! │         └──────────┬──────────┘                    │
//! │                    ▼                               │
//! │             vpngate-common                         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Keep this crate free of tokio; transport and server own all I/O
//!
//! ## Last Modified
//! v0.3.0 - Subnets, management parser, tunnel codec

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod protocol;
pub mod subnet;

// Re-export commonly used items
pub use error::{CoreError, Result};
pub use protocol::{ManagementEvent, ManagementParser, TunnelRequest};
pub use subnet::{Subnet, SubnetAllocator};
