// ============================================
// File: crates/vpngate-server/src/management/heartbeat.rs
// ============================================
//! # Heartbeat Reporter
//!
//! Background task that keeps this service instance marked alive in the
//! control-plane registry.
//!
//! ⚠️ Important Note for Next Developer:
//!   - The first tick fires immediately, so a freshly registered
//!     instance is confirmed alive without waiting a full interval
//!   - Failures never stop the loop; only the shutdown signal does
//!
//! Last Modified: v0.3.0 - Service instance heartbeat
// ============================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use vpngate_common::ServiceId;

use super::client::ControlPlaneClient;

/// Consecutive failures after which heartbeat errors are logged at error level.
const ESCALATE_AFTER: u32 = 3;

/// Periodic `is_alive` reporter for one service instance.
pub struct HeartbeatReporter {
    client: Arc<ControlPlaneClient>,
    service_id: ServiceId,
    interval: Duration,
}

impl HeartbeatReporter {
    /// Creates a reporter using the client's configured interval.
    pub fn new(client: Arc<ControlPlaneClient>, service_id: ServiceId) -> Self {
        let interval = client.config().heartbeat_interval();
        Self::with_interval(client, service_id, interval)
    }

    /// Creates a reporter with an explicit interval.
    pub fn with_interval(client: Arc<ControlPlaneClient>, service_id: ServiceId, interval: Duration) -> Self {
        Self {
            client,
            service_id,
            interval,
        }
    }

    /// Runs until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            service_id = %self.service_id,
            "Heartbeat reporter started ({}s)",
            self.interval.as_secs()
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.recv() => { info!("Heartbeat stopping"); break; }
                _ = interval.tick() => {
                    match self.client.heartbeat(self.service_id).await {
                        Ok(()) => {
                            if failures > 0 {
                                info!(failures, "Heartbeat recovered");
                            }
                            failures = 0;
                            debug!(service_id = %self.service_id, "Heartbeat sent");
                        }
                        Err(e) => {
                            failures += 1;
                            if failures >= ESCALATE_AFTER { error!(failures, "Heartbeat failed: {}", e); }
                            else { warn!(failures, "Heartbeat failed: {}", e); }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::routing::patch;
    use axum::{Json, Router};

    use super::*;
    use crate::management::config::ControlPlaneConfig;

    #[tokio::test]
    async fn test_heartbeat_until_shutdown() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/v5/service_instance(9)",
                patch(
                    |State(hits): State<Arc<AtomicUsize>>, Json(body): Json<serde_json::Value>| async move {
                        assert_eq!(body, serde_json::json!({ "is_alive": true }));
                        hits.fetch_add(1, Ordering::SeqCst);
                        "OK"
                    },
                ),
            )
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let config = ControlPlaneConfig {
            api_url: format!("http://{addr}"),
            api_key: "secret".into(),
            ..ControlPlaneConfig::default()
        };
        let client = Arc::new(ControlPlaneClient::new(config).unwrap());
        let reporter = HeartbeatReporter::with_interval(client, ServiceId(9), Duration::from_millis(20));

        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(reporter.run(rx));
        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(()).unwrap();
        task.await.unwrap();

        assert!(hits.load(Ordering::SeqCst) >= 2);
    }
}
