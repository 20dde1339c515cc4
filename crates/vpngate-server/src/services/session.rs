// ============================================
// File: crates/vpngate-server/src/services/session.rs
// ============================================
//! # Client Session Tracking
//!
//! ## Creation Reason
//! OpenVPN identifies connections by an ephemeral numeric client id, but
//! the control plane and draining work in device uuids. This map joins
//! the two and turns cumulative bytecount samples into per-interval
//! traffic figures.
//!
//! ## Main Functionality
//! - `ClientSession`: uuid plus the last bytecount sample
//! - `ClientSessions`: client id → session map with process totals
//! - `TrafficSample`: deltas and bitrates between two samples
//!
//! ## Session Lifecycle
//! ```text
//! ┌──────────┐  >CLIENT:ESTABLISHED  ┌──────────┐
//! │  (none)  │ ─────────────────────►│  Active  │◄──┐
//! └──────────┘                       └────┬─────┘   │ >BYTECOUNT_CLI
//!                                         │         │ (delta, bitrate)
//!                                         ├─────────┘
//!                       >CLIENT:DISCONNECT│ or drain
//!                                         ▼
//!                                   ┌──────────┐
//!                                   │ Removed  │
//!                                   └──────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - OpenVPN byte counters are cumulative per connection. A sample lower
//!   than the previous one yields a zero delta, never a wrap-around
//! - Sample times use `tokio::time::Instant` so paused-time tests work
//!
//! ## Last Modified
//! v0.3.0 - Client id keyed sessions with traffic accounting

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use vpngate_common::{ClientId, DeviceUuid};

// ============================================
// ClientSession
// ============================================

/// One connected VPN client.
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Device identity (certificate common name)
    pub uuid: DeviceUuid,
    /// Cumulative bytes received from the client
    pub bytes_received: u64,
    /// Cumulative bytes sent to the client
    pub bytes_sent: u64,
    /// Time of the last bytecount sample
    pub last_sample: Instant,
}

impl ClientSession {
    fn new(uuid: DeviceUuid) -> Self {
        Self {
            uuid,
            bytes_received: 0,
            bytes_sent: 0,
            last_sample: Instant::now(),
        }
    }
}

/// Traffic between two bytecount samples of one client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrafficSample {
    /// Bytes received since the previous sample
    pub rx_delta: u64,
    /// Bytes sent since the previous sample
    pub tx_delta: u64,
    /// Receive rate in bits per second
    pub rx_bitrate: f64,
    /// Send rate in bits per second
    pub tx_bitrate: f64,
}

fn bitrate(delta: u64, seconds: f64) -> f64 {
    if seconds <= 0.0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let bits = delta.saturating_mul(8) as f64;
    bits / seconds
}

// ============================================
// ClientSessions
// ============================================

/// Process-wide traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficTotals {
    /// Bytes received from all clients
    pub bytes_received: u64,
    /// Bytes sent to all clients
    pub bytes_sent: u64,
}

/// Active client sessions of one VPN instance.
#[derive(Debug, Default)]
pub struct ClientSessions {
    sessions: DashMap<ClientId, ClientSession>,
    total_received: AtomicU64,
    total_sent: AtomicU64,
}

impl ClientSessions {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an established client. A reused client id replaces the
    /// previous session.
    pub fn established(&self, client_id: ClientId, uuid: DeviceUuid) {
        debug!(client_id = %client_id, uuid = %uuid, "Client session established");
        if let Some(previous) = self.sessions.insert(client_id, ClientSession::new(uuid)) {
            warn!(
                client_id = %client_id,
                uuid = %previous.uuid,
                "Client id reused before disconnect"
            );
        }
    }

    /// Applies a bytecount sample and returns the traffic since the last
    /// one. `None` for an unknown client.
    pub fn bytecount(&self, client_id: ClientId, bytes_received: u64, bytes_sent: u64) -> Option<TrafficSample> {
        let Some(mut session) = self.sessions.get_mut(&client_id) else {
            warn!(client_id = %client_id, "Bytecount for unknown client");
            return None;
        };

        let now = Instant::now();
        let seconds = now.duration_since(session.last_sample).as_secs_f64();
        let rx_delta = bytes_received.saturating_sub(session.bytes_received);
        let tx_delta = bytes_sent.saturating_sub(session.bytes_sent);

        session.bytes_received = bytes_received;
        session.bytes_sent = bytes_sent;
        session.last_sample = now;

        self.total_received.fetch_add(rx_delta, Ordering::Relaxed);
        self.total_sent.fetch_add(tx_delta, Ordering::Relaxed);

        let sample = TrafficSample {
            rx_delta,
            tx_delta,
            rx_bitrate: bitrate(rx_delta, seconds),
            tx_bitrate: bitrate(tx_delta, seconds),
        };
        debug!(
            client_id = %client_id,
            uuid = %session.uuid,
            rx = rx_delta,
            tx = tx_delta,
            rx_bps = sample.rx_bitrate,
            tx_bps = sample.tx_bitrate,
            "Bytecount sample"
        );
        Some(sample)
    }

    /// Removes a client, returning its session.
    pub fn disconnect(&self, client_id: ClientId) -> Option<ClientSession> {
        let removed = self.sessions.remove(&client_id).map(|(_, s)| s);
        match &removed {
            Some(session) => debug!(client_id = %client_id, uuid = %session.uuid, "Client session closed"),
            None => debug!(client_id = %client_id, "Disconnect for unknown client"),
        }
        removed
    }

    /// Removes every session of `uuid`, returning how many were removed.
    pub fn remove_uuid(&self, uuid: &DeviceUuid) -> usize {
        let mut removed = 0;
        self.sessions.retain(|_, session| {
            let keep = &session.uuid != uuid;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            debug!(uuid = %uuid, removed, "Client sessions closed");
        }
        removed
    }

    /// Number of active sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if no client is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of connected device uuids, sorted and deduplicated.
    #[must_use]
    pub fn uuids(&self) -> Vec<DeviceUuid> {
        let mut uuids: Vec<DeviceUuid> = self.sessions.iter().map(|s| s.uuid.clone()).collect();
        uuids.sort();
        uuids.dedup();
        uuids
    }

    /// Traffic accumulated since the process started.
    #[must_use]
    pub fn totals(&self) -> TrafficTotals {
        TrafficTotals {
            bytes_received: self.total_received.load(Ordering::Relaxed),
            bytes_sent: self.total_sent.load(Ordering::Relaxed),
        }
    }
}

// ============================================
// Tests
// ============================================
