// ============================================
// File: crates/vpngate-common/src/lib.rs
// ============================================
//! # vpngate Common - Shared Utilities Library
//!
//! ## Creation Reason
//! Provides the identifier types, base error and time helpers shared by
//! every vpngate crate.
//!
//! ## Main Functionality
//! - [`types`]: `DeviceUuid`, `ClientId`, `InstanceId`, `ServiceId`
//! - [`time`]: `Deadline` for bounded polling loops
//! - [`error`]: Common error types and result aliases
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              vpngate-server                         │
//! │                    │                                │
//! │         ┌──────────┴──────────┐                    │
//! │         ▼                     ▼                    │
//! │   vpngate-core         vpngate-transport           │
//! │         │                     │                    │
//! │         └──────────┬──────────┘                    │
//! │                    ▼                               │
//! │             vpngate-common  ◄── You are here      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - This crate is the foundation - changes affect everything
//! - Keep dependencies minimal (serde + thiserror only)
//!
//! ## Last Modified
//! v0.3.0 - Gateway identifiers

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod time;
pub mod types;

// Re-export commonly used items at crate root
pub use error::{CommonError, Result};
pub use types::{ClientId, DeviceUuid, InstanceId, ServiceId};
