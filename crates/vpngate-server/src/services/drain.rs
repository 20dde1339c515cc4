// ============================================
// File: crates/vpngate-server/src/services/drain.rs
// ============================================
//! # Drain Coordinator
//!
//! ## Creation Reason
//! Dropping every VPN session at once makes thousands of devices
//! reconnect at the same instant. On shutdown the worker instead stops
//! admitting new sessions and disconnects existing ones at a paced rate
//! that fits the shutdown budget.
//!
//! ## Drain Sequence
//! ```text
//! SIGTERM
//!   │
//!   ▼
//! load balancer: set server <name> state drain
//!   │
//!   ├── 0 clients ─────────────────────────────┐
//!   │                                           │
//!   ▼  delay = min(max_delay, budget / count)   │
//! for uuid in snapshot:                         │
//!   spawn(kill uuid, drop its sessions)         │
//!   sleep(delay)                                │
//!   │                                           │
//!   ▼                                           ▼
//! drain complete ──► final grace ──► exit 0
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - A failed disconnect is logged and never blocks the pacing loop; the
//!   sessions of that uuid stay until OpenVPN reports the disconnect
//! - A failed load-balancer call is logged and draining proceeds anyway
//!
//! ## Last Modified
//! v0.3.0 - Paced client draining

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use vpngate_common::time::millis;
use vpngate_common::DeviceUuid;
use vpngate_transport::{BackendState, LoadBalancer, ManagementCommand, ManagementConsole};

use crate::error::Result;
use crate::services::session::ClientSessions;

// ============================================
// ClientDisconnector
// ============================================

/// Forcibly disconnects a VPN client by identity.
#[async_trait]
pub trait ClientDisconnector: Send + Sync {
    /// Disconnects every session of `uuid`.
    async fn disconnect(&self, uuid: &DeviceUuid) -> Result<()>;
}

#[async_trait]
impl ClientDisconnector for ManagementConsole {
    async fn disconnect(&self, uuid: &DeviceUuid) -> Result<()> {
        self.exec(&ManagementCommand::Kill(uuid.to_string())).await?;
        Ok(())
    }
}

// ============================================
// DrainPolicy
// ============================================

/// Drain timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    /// Total time to spread disconnects over.
    pub budget: Duration,
    /// Longest wait between two disconnects.
    pub max_delay: Duration,
    /// Wait after completion before exiting.
    pub final_grace: Duration,
}

impl DrainPolicy {
    /// Delay between disconnects for `clients` clients.
    #[must_use]
    pub fn pacing_delay(&self, clients: usize) -> Duration {
        if clients == 0 {
            return Duration::ZERO;
        }
        let clients = u32::try_from(clients).unwrap_or(u32::MAX);
        (self.budget / clients).min(self.max_delay)
    }
}

/// Outcome of a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Clients instructed to disconnect.
    pub clients: usize,
    /// Delay used between them.
    pub delay: Duration,
    /// Whether the load balancer accepted the drain state.
    pub balancer_drained: bool,
}

// ============================================
// DrainCoordinator
// ============================================

/// Winds a worker down without a reconnect storm.
pub struct DrainCoordinator {
    balancer: Arc<dyn LoadBalancer>,
    server_name: String,
    disconnector: Arc<dyn ClientDisconnector>,
    sessions: Arc<ClientSessions>,
    policy: DrainPolicy,
}

impl DrainCoordinator {
    /// Creates a coordinator for backend server `server_name`. Sessions
    /// of a successfully disconnected uuid are removed from `sessions`.
    pub fn new(
        balancer: Arc<dyn LoadBalancer>,
        server_name: impl Into<String>,
        disconnector: Arc<dyn ClientDisconnector>,
        sessions: Arc<ClientSessions>,
        policy: DrainPolicy,
    ) -> Self {
        Self {
            balancer,
            server_name: server_name.into(),
            disconnector,
            sessions,
            policy,
        }
    }

    /// Drain policy.
    #[must_use]
    pub const fn policy(&self) -> &DrainPolicy {
        &self.policy
    }

    /// Stops admission and disconnects `clients` at a paced rate.
    ///
    /// Returns once every client has been instructed to disconnect and
    /// the last pacing delay has passed.
    pub async fn drain(&self, clients: &[DeviceUuid]) -> DrainReport {
        let balancer_drained = match self.balancer.set_state(&self.server_name, BackendState::Drain).await {
            Ok(()) => true,
            Err(e) => {
                error!(server = %self.server_name, error = %e, "Failed to put backend into drain state");
                false
            }
        };

        let delay = self.policy.pacing_delay(clients.len());
        if clients.is_empty() {
            info!("No clients connected, drain complete");
            return DrainReport {
                clients: 0,
                delay,
                balancer_drained,
            };
        }

        info!(
            clients = clients.len(),
            delay_ms = millis(delay),
            "Draining clients"
        );
        for uuid in clients {
            let disconnector = Arc::clone(&self.disconnector);
            let sessions = Arc::clone(&self.sessions);
            let uuid = uuid.clone();
            tokio::spawn(async move {
                match disconnector.disconnect(&uuid).await {
                    Ok(()) => {
                        let removed = sessions.remove_uuid(&uuid);
                        debug!(uuid = %uuid, sessions = removed, "Client disconnected");
                    }
                    Err(e) => warn!(uuid = %uuid, error = %e, "Failed to disconnect client"),
                }
            });
            tokio::time::sleep(delay).await;
        }

        DrainReport {
            clients: clients.len(),
            delay,
            balancer_drained,
        }
    }

    /// Drains, reports completion on `done`, then waits out the final
    /// grace window.
    pub async fn run(&self, clients: &[DeviceUuid], done: oneshot::Sender<DrainReport>) {
        let report = self.drain(clients).await;
        info!(clients = report.clients, "Drain complete");
        let _ = done.send(report);
        tokio::time::sleep(self.policy.final_grace).await;
    }
}

impl std::fmt::Debug for DrainCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainCoordinator")
            .field("server_name", &self.server_name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tokio::time::Instant;

    use super::*;
    use crate::error::ServerError;
    use vpngate_common::ClientId;

    #[derive(Default)]
    struct RecordingBalancer {
        calls: Mutex<Vec<(String, BackendState)>>,
        fail: bool,
    }

    #[async_trait]
    impl LoadBalancer for RecordingBalancer {
        async fn register(&self, _server: &str, _host: &str, _port: u16) -> vpngate_transport::Result<()> {
            Ok(())
        }

        async fn set_state(&self, server: &str, state: BackendState) -> vpngate_transport::Result<()> {
            self.calls.lock().push((server.to_string(), state));
            if self.fail {
                return Err(vpngate_transport::TransportError::ConsoleClosed);
            }
            Ok(())
        }
    }

    struct RecordingDisconnector {
        start: Instant,
        calls: Mutex<Vec<(DeviceUuid, Duration)>>,
        fail_for: Option<DeviceUuid>,
    }

    #[async_trait]
    impl ClientDisconnector for RecordingDisconnector {
        async fn disconnect(&self, uuid: &DeviceUuid) -> Result<()> {
            self.calls.lock().push((uuid.clone(), self.start.elapsed()));
            if self.fail_for.as_ref() == Some(uuid) {
                return Err(ServerError::internal("kill failed"));
            }
            Ok(())
        }
    }

    fn uuids(n: usize) -> Vec<DeviceUuid> {
        (0..n).map(|i| DeviceUuid::new(format!("dev{i}")).unwrap()).collect()
    }

    fn policy(budget_ms: u64, max_ms: u64) -> DrainPolicy {
        DrainPolicy {
            budget: Duration::from_millis(budget_ms),
            max_delay: Duration::from_millis(max_ms),
            final_grace: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_pacing_delay() {
        assert_eq!(policy(900, 1000).pacing_delay(3), Duration::from_millis(300));
        assert_eq!(policy(120_000, 1000).pacing_delay(3), Duration::from_millis(1000));
        assert_eq!(policy(900, 1000).pacing_delay(0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_clients_paced_300ms() {
        let balancer = Arc::new(RecordingBalancer::default());
        let disconnector = Arc::new(RecordingDisconnector {
            start: Instant::now(),
            calls: Mutex::new(Vec::new()),
            fail_for: Some(DeviceUuid::new("dev1").unwrap()),
        });
        let sessions = Arc::new(ClientSessions::new());
        let clients = uuids(3);
        for (i, uuid) in clients.iter().enumerate() {
            sessions.established(ClientId(i as u64), uuid.clone());
        }
        sessions.established(ClientId(10), clients[0].clone());
        let coordinator = DrainCoordinator::new(
            balancer.clone(),
            "vpn-workers/vpn1",
            disconnector.clone(),
            sessions.clone(),
            policy(900, 1000),
        );

        let (tx, rx) = oneshot::channel();
        let start = Instant::now();
        let run = tokio::spawn(async move { coordinator.run(&clients, tx).await });

        let report = rx.await.unwrap();
        let completed_at = start.elapsed();
        assert_eq!(report.clients, 3);
        assert_eq!(report.delay, Duration::from_millis(300));
        assert!(report.balancer_drained);

        // Completion only after every client was instructed
        let calls = disconnector.calls.lock().clone();
        assert_eq!(calls.len(), 3);
        let offsets: Vec<u128> = calls.iter().map(|(_, at)| at.as_millis()).collect();
        assert_eq!(offsets, vec![0, 300, 600]);
        assert!(completed_at >= Duration::from_millis(900));

        // Only the failed kill leaves its session behind
        assert_eq!(sessions.uuids(), vec![DeviceUuid::new("dev1").unwrap()]);
        assert_eq!(sessions.len(), 1);

        assert_eq!(
            balancer.calls.lock().clone(),
            vec![("vpn-workers/vpn1".to_string(), BackendState::Drain)]
        );

        // Final grace keeps the task alive
        assert!(!run.is_finished());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(run.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_clients_completes_immediately() {
        let balancer = Arc::new(RecordingBalancer {
            fail: true,
            ..RecordingBalancer::default()
        });
        let disconnector = Arc::new(RecordingDisconnector {
            start: Instant::now(),
            calls: Mutex::new(Vec::new()),
            fail_for: None,
        });
        let coordinator = DrainCoordinator::new(
            balancer,
            "b/s",
            disconnector.clone(),
            Arc::new(ClientSessions::new()),
            policy(900, 1000),
        );

        let start = Instant::now();
        let report = coordinator.drain(&[]).await;
        assert_eq!(report.clients, 0);
        assert!(!report.balancer_drained);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(disconnector.calls.lock().is_empty());
    }
}
