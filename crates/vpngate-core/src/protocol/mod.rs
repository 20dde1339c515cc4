// ============================================
// File: crates/vpngate-core/src/protocol/mod.rs
// ============================================
//! # Protocol Module
//!
//! ## Creation Reason
//! Pure text protocols the gateway speaks: the OpenVPN management
//! console and the CONNECT-style tunnel dialect shared with peers.
//!
//! ### Submodules
//! - [`management`]: line buffer + client ENV state machine
//! - [`tunnel`]: CONNECT heads, tunnel targets, `Forwarded` chains
//!
//! ## Protocol Overview
//! ```text
//! ┌──────────────┐  >LOG / >CLIENT / >BYTECOUNT_CLI   ┌──────────────┐
//! │   OpenVPN    │ ─────────────────────────────────► │  management  │
//! │   console    │ ◄───────────────────────────────── │    parser    │
//! └──────────────┘   hold release / kill / status     └──────────────┘
//!
//! ┌──────────────┐   CONNECT <uuid>.balena:<port>     ┌──────────────┐
//! │ tunnel client│ ─────────────────────────────────► │ tunnel codec │
//! │  or peer gw  │ ◄───────────────────────────────── │              │
//! └──────────────┘   HTTP/1.0 <status>                └──────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - No I/O in this module; sockets live in vpngate-transport/server
//!
//! ## Last Modified
//! v0.3.0 - Management and tunnel protocols

pub mod management;
pub mod tunnel;

// Re-export primary types
pub use management::{
    ClientEvent, ClientEventKind, LineBuffer, LogLevel, ManagementEvent, ManagementParser,
};
pub use tunnel::{ConnectRequest, ForwardedChain, TunnelRequest, TunnelTarget};
