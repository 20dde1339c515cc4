// ============================================
// File: crates/vpngate-transport/src/lib.rs
// ============================================
//! # vpngate Transport - OS Interaction Layer
//!
//! ## Creation Reason
//! Everything the gateway does through the operating system rather than
//! over HTTP: supervising OpenVPN, talking to its management console,
//! driving HAProxy and opening tunnel sockets.
//!
//! ## Main Functionality
//!
//! ### Modules
//! - [`process`]: orphan reaping, subprocess spawn, startup probe
//! - [`console`]: management console connection and commands
//! - [`haproxy`]: load-balancer registration and drain
//! - [`net`]: keepalive tunnel sockets
//! - [`traits`]: `LoadBalancer` seam for testing
//! - [`error`]: transport-specific error types
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              vpngate-server                         │
//! │                    │                                │
//! │         ┌──────────┴──────────┐                    │
//! │         ▼                     ▼                    │
//! │   vpngate-core         vpngate-transport           │
//! │                        You are here ◄──            │
//! │         │                     │                    │
//! │         └──────────┬──────────┘                    │
//! │                    ▼                               │
//! │             vpngate-common                         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Platform Support
//! Unix only: signals come from `nix` and HAProxy is reached over a unix
//! socket.
//!
//! ## ⚠️ Important Note for Next Developer
//! - Use the `LoadBalancer` trait, not `HaproxyClient`, in server logic
//! - Tests here spawn real processes (`sh`, `sleep`) and bind loopback
//!
//! ## Last Modified
//! v0.3.0 - OpenVPN supervision, console and load-balancer sockets

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod console;
pub mod error;
pub mod haproxy;
pub mod net;
pub mod process;
pub mod traits;

// Re-export primary types
pub use console::{ManagementCommand, ManagementConsole};
pub use error::{Result, TransportError};
pub use haproxy::HaproxyClient;
pub use process::{ExitInfo, OutputStream, ProcessEvent, ProcessHandle, ReapPolicy};
pub use traits::{BackendState, LoadBalancer};
