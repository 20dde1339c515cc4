// ============================================
// File: crates/vpngate-server/src/management/reconciler.rs
// ============================================
//! # Device State Reconciler
//!
//! ## Creation Reason
//! OpenVPN reports connects and disconnects in bursts, sometimes out of
//! order and sometimes twice. The control plane only needs to converge
//! on the latest state per device, in as few requests as possible, and
//! without ever blocking the management event stream.
//!
//! ## Main Functionality
//! - `DeviceStateReconciler::set_connected`: synchronous, fire-and-forget
//! - A single-flight background pass that buckets pending uuids into
//!   connects and disconnects and posts them in batches
//!
//! ## Pass Flow
//! ```text
//! set_connected(u, c) ──► entries[u].target = c ──► pending += u ──► trigger
//!                                                                       │
//!       ┌─────────────────────────── running? ──yes──► no-op ◄──────────┘
//!       │ no
//!       ▼
//! ┌─► snapshot + clear pending
//! │        │ bucket: target != current || force
//! │        ▼
//! │   connects ─┬─ chunks ─► POST client-connect    ok: current = true
//! │   disconnects ┴ chunks ─► POST client-disconnect fail: pending += chunk
//! │        │
//! │   pending empty? ──yes──► idle
//! │        │ no
//! └── sleep(retry floor)
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - The `running` flag is load-bearing: two concurrent passes would both
//!   read-then-clear the pending set and double report
//! - Entries are never removed. Memory is bounded by the device population
//! - A failed batch is never retried inside the pass. It goes back to
//!   `pending` and waits for the retry floor
//!
//! ## Last Modified
//! v0.3.0 - Initial reconciler

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, trace};

use vpngate_common::{DeviceUuid, ServiceId};

use super::client::ControlPlane;
use super::models::DeviceStateReport;
use super::reporting::{ErrorReporter, DEVICE_STATE_UPDATE_ERROR};

// ============================================
// DeviceStateEntry
// ============================================

/// Reconciliation state of one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStateEntry {
    /// Last value requested by `set_connected`.
    pub target_connected: bool,
    /// Last value confirmed by the control plane.
    pub current_connected: bool,
    /// Report even if target and current agree.
    pub force_update: bool,
}

impl DeviceStateEntry {
    /// Whether a pass would report this entry.
    #[must_use]
    pub const fn needs_report(&self) -> bool {
        self.target_connected != self.current_connected || self.force_update
    }
}

#[derive(Debug, Default)]
struct ReconcilerState {
    entries: HashMap<DeviceUuid, DeviceStateEntry>,
    pending: HashSet<DeviceUuid>,
}

struct Inner {
    service_id: ServiceId,
    api: Arc<dyn ControlPlane>,
    reporter: Arc<dyn ErrorReporter>,
    batch_size: usize,
    retry_floor: Duration,
    state: Mutex<ReconcilerState>,
    running: AtomicBool,
}

// ============================================
// DeviceStateReconciler
// ============================================

/// Converges device connection state to the control plane.
#[derive(Clone)]
pub struct DeviceStateReconciler {
    inner: Arc<Inner>,
}

impl DeviceStateReconciler {
    /// Creates a reconciler reporting as `service_id`.
    pub fn new(
        service_id: ServiceId,
        api: Arc<dyn ControlPlane>,
        reporter: Arc<dyn ErrorReporter>,
        batch_size: usize,
        retry_floor: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                service_id,
                api,
                reporter,
                batch_size: batch_size.max(1),
                retry_floor,
                state: Mutex::new(ReconcilerState::default()),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Records the desired state of `uuid` and schedules a pass.
    ///
    /// Must be called from within a tokio runtime.
    pub fn set_connected(&self, uuid: &DeviceUuid, connected: bool) {
        {
            let mut state = self.inner.state.lock();
            let entry = state.entries.entry(uuid.clone()).or_default();
            if connected && entry.current_connected {
                // Ownership may have moved away and back; the control
                // plane must learn the current owner again.
                entry.force_update = true;
            }
            entry.target_connected = connected;
            state.pending.insert(uuid.clone());
        }
        trace!(uuid = %uuid, connected, "Device state queued");
        Inner::trigger(&self.inner);
    }

    /// Current entry for `uuid`.
    #[must_use]
    pub fn entry(&self, uuid: &DeviceUuid) -> Option<DeviceStateEntry> {
        self.inner.state.lock().entries.get(uuid).copied()
    }

    /// Whether `uuid` is queued for the next pass.
    #[must_use]
    pub fn is_pending(&self, uuid: &DeviceUuid) -> bool {
        self.inner.state.lock().pending.contains(uuid)
    }

    /// Number of queued uuids.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Whether a pass is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for DeviceStateReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("DeviceStateReconciler")
            .field("service_id", &self.inner.service_id)
            .field("devices", &state.entries.len())
            .field("pending", &state.pending.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Inner {
    /// Starts the loop unless one is already running.
    fn trigger(this: &Arc<Self>) {
        if this
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = Arc::clone(this);
            tokio::spawn(async move { inner.run().await });
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            self.pass().await;

            if self.state.lock().pending.is_empty() {
                self.running.store(false, Ordering::Release);
                // A producer may have queued work between the check and
                // the store; it saw `running` and did not spawn.
                let more = !self.state.lock().pending.is_empty();
                if more
                    && self
                        .running
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    continue;
                }
                return;
            }
            tokio::time::sleep(self.retry_floor).await;
        }
    }

    /// One reconciliation pass.
    async fn pass(self: &Arc<Self>) {
        let (connects, disconnects) = {
            let mut state = self.state.lock();
            let pending = mem::take(&mut state.pending);
            let mut connects = Vec::new();
            let mut disconnects = Vec::new();
            for uuid in pending {
                match state.entries.get(&uuid) {
                    Some(entry) if entry.needs_report() => {
                        if entry.target_connected {
                            connects.push(uuid);
                        } else {
                            disconnects.push(uuid);
                        }
                    }
                    _ => {}
                }
            }
            (connects, disconnects)
        };

        if connects.is_empty() && disconnects.is_empty() {
            return;
        }
        debug!(
            connects = connects.len(),
            disconnects = disconnects.len(),
            "Reconciling device state"
        );

        let mut batches = JoinSet::new();
        for (uuids, connected) in [(disconnects, false), (connects, true)] {
            for chunk in uuids.chunks(self.batch_size) {
                let inner = Arc::clone(self);
                let chunk = chunk.to_vec();
                batches.spawn(async move { inner.report_batch(chunk, connected).await });
            }
        }
        while batches.join_next().await.is_some() {}
    }

    async fn report_batch(&self, uuids: Vec<DeviceUuid>, connected: bool) {
        let report = DeviceStateReport {
            service_id: self.service_id,
            uuids,
            connected,
        };
        let result = self.api.report_device_state(&report).await;

        let mut state = self.state.lock();
        let ReconcilerState { entries, pending } = &mut *state;
        match result {
            Ok(()) => {
                for uuid in &report.uuids {
                    if let Some(entry) = entries.get_mut(uuid) {
                        entry.current_connected = connected;
                        if !pending.contains(uuid) {
                            entry.force_update = false;
                        }
                    }
                    debug!(uuid = %uuid, connected, "Updated device state");
                }
                info!(count = report.uuids.len(), connected, "Device state batch reported");
            }
            Err(e) => {
                for uuid in &report.uuids {
                    if let Some(entry) = entries.get_mut(uuid) {
                        if entry.target_connected == connected {
                            entry.force_update = true;
                        }
                    }
                    pending.insert(uuid.clone());
                }
                drop(state);
                self.reporter.capture(
                    &e,
                    DEVICE_STATE_UPDATE_ERROR,
                    &[
                        ("service_id", self.service_id.to_string()),
                        ("connected", connected.to_string()),
                        ("count", report.uuids.len().to_string()),
                    ],
                );
            }
        }
    }
}

// ============================================
// Tests
// ============================================
