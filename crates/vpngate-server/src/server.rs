// ============================================
// File: crates/vpngate-server/src/server.rs
// ============================================
//! # Worker Orchestration
//!
//! ## Creation Reason
//! A host runs one gateway worker per OpenVPN instance plus proxy
//! workers for tunnels. Each worker is a separate OS process started by
//! an external supervisor; this module wires the services of one worker
//! together and owns its lifecycle.
//!
//! ## Main Functionality
//! - `GatewayWorker`: OpenVPN lifecycle, client events, state reporting,
//!   load-balancer registration and draining
//! - `ProxyWorker`: tunnel listeners on the connect and forward ports
//! - `GatewayEvents`: management event dispatch, separated for tests
//!
//! ## Gateway Lifecycle
//! ```text
//! register / --service-id
//!        │
//!        ▼
//! reap orphan ─► spawn (held) ─► probe console ─► connect console
//!        │
//!        ▼
//! log on all? ─► bytecount N? ─► hold release ─► haproxy ready ─► heartbeat
//!        │
//!        ▼
//! ┌──────────────── event loop ────────────────┐
//! │ >CLIENT:ESTABLISHED  → sessions, connected │
//! │ >CLIENT:DISCONNECT   → sessions, !connected│
//! │ >CLIENT:CONNECT      → spawned auth task   │
//! │ >BYTECOUNT_CLI       → traffic sample      │
//! │ process exit         → fatal               │
//! └──────────────────┬─────────────────────────┘
//!                    │ SIGTERM / SIGINT
//!                    ▼
//!            drain (paced kills) ─► final grace ─► stop OpenVPN ─► exit 0
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - There is no in-process restart. An OpenVPN exit or a closed console
//!   ends the worker with an error and the supervisor restarts it
//! - Disconnect events keep flowing to the reconciler while draining, and
//!   an OpenVPN exit mid-drain still ends the worker with an error
//!
//! ## Last Modified
//! v0.3.0 - Gateway and proxy workers

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use vpngate_common::time::millis;
use vpngate_common::{DeviceUuid, InstanceId, ServiceId};
use vpngate_core::protocol::management::{ClientEvent, ClientEventKind, LogLevel, ManagementEvent};
use vpngate_transport::{
    HaproxyClient, LoadBalancer, ManagementCommand, ManagementConsole, ProcessEvent, TransportError,
};

use crate::config::{ClientAuthMode, GatewayConfig};
use crate::error::{Result, ServerError};
use crate::management::reporting::ErrorReporter;
use crate::management::{
    ClientAuthenticator, ControlPlaneClient, DeviceStateReconciler, HeartbeatReporter,
    TracingErrorReporter,
};
use crate::services::{
    ClientDisconnector, ClientSessions, DrainCoordinator, SystemResolver, TunnelRouter,
    TunnelSettings, VpnManager,
};

/// Reason OpenVPN logs for a rejected client.
const AUTH_FAILED: &str = "AUTH_FAILED";

// ============================================
// Shared helpers
// ============================================

/// Waits for SIGTERM or SIGINT.
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => info!("Received SIGTERM"),
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, waiting for SIGINT only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Cannot listen for SIGINT");
            }
        }
    }
}

async fn resolve_service_id(client: &ControlPlaneClient, service_id: Option<ServiceId>) -> Result<ServiceId> {
    match service_id {
        Some(id) => Ok(id),
        None => {
            let id = client.register_service().await?;
            info!(service_id = %id, "Registered service instance");
            Ok(id)
        }
    }
}

// ============================================
// GatewayEvents
// ============================================

/// Dispatches management console events of one gateway.
pub struct GatewayEvents {
    verbose: bool,
    auth_mode: ClientAuthMode,
    sessions: Arc<ClientSessions>,
    reconciler: DeviceStateReconciler,
    authenticator: Arc<dyn ClientAuthenticator>,
}

impl GatewayEvents {
    /// Creates a dispatcher.
    pub fn new(
        verbose: bool,
        auth_mode: ClientAuthMode,
        sessions: Arc<ClientSessions>,
        reconciler: DeviceStateReconciler,
        authenticator: Arc<dyn ClientAuthenticator>,
    ) -> Self {
        Self {
            verbose,
            auth_mode,
            sessions,
            reconciler,
            authenticator,
        }
    }

    /// Sessions of this gateway.
    #[must_use]
    pub fn sessions(&self) -> &Arc<ClientSessions> {
        &self.sessions
    }

    /// Handles one event. Authentication replies go out on `vpn`'s console.
    pub fn handle(&self, vpn: &VpnManager, event: ManagementEvent) {
        match event {
            ManagementEvent::Log { level, message, .. } => self.log(level, &message),
            ManagementEvent::Client(client) => self.client(vpn, client),
            ManagementEvent::ByteCount {
                client_id,
                bytes_received,
                bytes_sent,
            } => {
                self.sessions.bytecount(client_id, bytes_received, bytes_sent);
            }
            ManagementEvent::Notification { source, payload } => {
                debug!(source = %source, "OpenVPN: {}", payload);
            }
        }
    }

    fn log(&self, level: LogLevel, message: &str) {
        if !self.verbose && !level.is_warning_or_worse() {
            return;
        }
        match level {
            LogLevel::Debug => debug!(target: "openvpn", "{}", message),
            LogLevel::Info | LogLevel::Notice => info!(target: "openvpn", "{}", message),
            LogLevel::Warning => warn!(target: "openvpn", "{}", message),
            LogLevel::Error | LogLevel::Emergency => error!(target: "openvpn", "{}", message),
        }
    }

    fn client(&self, vpn: &VpnManager, event: ClientEvent) {
        match event.kind {
            ClientEventKind::Established => {
                let Some(uuid) = Self::uuid(&event) else { return };
                info!(client_id = %event.client_id, uuid = %uuid, "Client connected");
                self.sessions.established(event.client_id, uuid.clone());
                self.reconciler.set_connected(&uuid, true);
            }
            ClientEventKind::Disconnect => {
                let uuid = match self.sessions.disconnect(event.client_id) {
                    Some(session) => Some(session.uuid),
                    None => Self::uuid(&event),
                };
                if let Some(uuid) = uuid {
                    info!(client_id = %event.client_id, uuid = %uuid, "Client disconnected");
                    self.reconciler.set_connected(&uuid, false);
                }
            }
            ClientEventKind::Connect if self.auth_mode == ClientAuthMode::Management => {
                self.authenticate(vpn, &event);
            }
            ClientEventKind::Connect | ClientEventKind::Address => {
                debug!(client_id = %event.client_id, kind = event.kind.as_str(), "Client event");
            }
        }
    }

    fn uuid(event: &ClientEvent) -> Option<DeviceUuid> {
        let name = event.common_name()?;
        match DeviceUuid::new(name) {
            Ok(uuid) => Some(uuid),
            Err(e) => {
                warn!(client_id = %event.client_id, error = %e, "Client has an unusable common name");
                None
            }
        }
    }

    /// Answers a CONNECT in a task of its own so a slow control plane
    /// never holds up other clients' events.
    fn authenticate(&self, vpn: &VpnManager, event: &ClientEvent) {
        let Some(console) = vpn.console() else {
            warn!(client_id = %event.client_id, "Client connect without a management console");
            return;
        };
        let authenticator = Arc::clone(&self.authenticator);
        let client_id = event.client_id;
        let key_id = event.key_id().unwrap_or(0);
        let username = event.env("username").unwrap_or_default().to_string();
        let password = event.env("password").unwrap_or_default().to_string();

        tokio::spawn(async move {
            let allowed = if username.is_empty() || password.is_empty() {
                false
            } else {
                match authenticator.authenticate(&username, &password).await {
                    Ok(allowed) => allowed,
                    Err(e) => {
                        warn!(client_id = %client_id, error = %e, "Client authentication failed");
                        false
                    }
                }
            };

            let reply = if allowed {
                debug!(client_id = %client_id, username, "Client authenticated");
                ManagementCommand::ClientAuthNt { client_id, key_id }
            } else {
                info!(client_id = %client_id, username, "Client rejected");
                ManagementCommand::ClientDeny {
                    client_id,
                    key_id,
                    reason: AUTH_FAILED.to_string(),
                }
            };
            if let Err(e) = console.exec(&reply).await {
                error!(client_id = %client_id, error = %e, "Failed to answer client authentication");
            }
        });
    }
}

impl std::fmt::Debug for GatewayEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayEvents")
            .field("verbose", &self.verbose)
            .field("auth_mode", &self.auth_mode)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

// ============================================
// GatewayWorker
// ============================================

/// One OpenVPN instance and everything around it.
///
/// # Lifecycle
/// 1. Create with `GatewayWorker::new(config, instance, service_id)`
/// 2. Run with `worker.run().await`
/// 3. SIGTERM/SIGINT drains clients, then `run` returns `Ok(())`
pub struct GatewayWorker {
    config: GatewayConfig,
    instance: InstanceId,
    service_id: Option<ServiceId>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GatewayWorker {
    /// Creates a worker. Without `service_id` the worker registers a new
    /// service instance on start.
    pub fn new(config: GatewayConfig, instance: InstanceId, service_id: Option<ServiceId>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            instance,
            service_id,
            shutdown_tx,
        }
    }

    /// Runs the worker until it is drained or fails.
    ///
    /// # Errors
    /// Configuration, startup, and OpenVPN exit errors. All are fatal.
    pub async fn run(&self) -> Result<()> {
        info!(instance = %self.instance, "Starting vpngate gateway v{}", env!("CARGO_PKG_VERSION"));
        self.config.check_instance(self.instance)?;

        let client = Arc::new(ControlPlaneClient::new(self.config.control_plane.clone())?);
        let service_id = resolve_service_id(&client, self.service_id).await?;
        let reporter: Arc<dyn ErrorReporter> = Arc::new(TracingErrorReporter);
        let reconciler = DeviceStateReconciler::new(
            service_id,
            client.clone(),
            reporter,
            self.config.control_plane.device_state_batch_size,
            self.config.control_plane.retry_floor(),
        );
        let events = GatewayEvents::new(
            self.config.vpn.verbose,
            self.config.vpn.client_auth,
            Arc::new(ClientSessions::new()),
            reconciler,
            client.clone(),
        );

        // OpenVPN
        let mut vpn = VpnManager::from_config(&self.config, self.instance)?;
        let (process_tx, mut process_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        vpn.start(process_tx).await?;
        let console = match self.bring_up(&mut vpn, event_tx).await {
            Ok(console) => console,
            Err(e) => {
                vpn.stop(self.stop_grace()).await;
                return Err(ServerError::startup_failed(e.to_string()));
            }
        };

        // Admission
        let balancer: Arc<dyn LoadBalancer> = Arc::new(HaproxyClient::new(self.config.haproxy.socket_path.clone()));
        let server_name = self.config.haproxy.server_name(self.instance);
        let vpn_port = self.config.vpn.vpn_port(self.instance)?;
        match balancer
            .register(&server_name, &self.config.haproxy.register_host, vpn_port)
            .await
        {
            Ok(()) => info!(server = %server_name, port = vpn_port, "Registered with load balancer"),
            Err(e) => warn!(server = %server_name, error = %e, "Load balancer registration failed"),
        }

        let heartbeat = tokio::spawn(
            HeartbeatReporter::new(client.clone(), service_id).run(self.shutdown_tx.subscribe()),
        );
        info!(instance = %self.instance, service_id = %service_id, "Gateway ready");

        // Event loop
        let signal = shutdown_signal();
        tokio::pin!(signal);
        let outcome = loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => events.handle(&vpn, event),
                    None => break Err(ServerError::Transport(TransportError::ConsoleClosed)),
                },
                event = process_rx.recv() => {
                    if let Some(err) = Self::process_event(event) {
                        break Err(err);
                    }
                }
                () = &mut signal => break Ok(()),
            }
        };

        let outcome = match outcome {
            Ok(()) => self.drain(&vpn, &events, console, balancer, server_name, &mut event_rx, &mut process_rx).await,
            Err(e) => Err(e),
        };

        let _ = self.shutdown_tx.send(());
        let _ = heartbeat.await;
        vpn.stop(self.stop_grace()).await;

        match &outcome {
            Ok(()) => info!(instance = %self.instance, "Gateway shutdown complete"),
            Err(e) => error!(instance = %self.instance, error = %e, "Gateway stopped"),
        }
        outcome
    }

    /// Paces client disconnects while still serving console events. An
    /// OpenVPN exit aborts the drain with an error.
    #[allow(clippy::too_many_arguments)]
    async fn drain(
        &self,
        vpn: &VpnManager,
        events: &GatewayEvents,
        console: Arc<ManagementConsole>,
        balancer: Arc<dyn LoadBalancer>,
        server_name: String,
        event_rx: &mut mpsc::UnboundedReceiver<ManagementEvent>,
        process_rx: &mut mpsc::UnboundedReceiver<ProcessEvent>,
    ) -> Result<()> {
        let disconnector: Arc<dyn ClientDisconnector> = console;
        let coordinator = DrainCoordinator::new(
            balancer,
            server_name,
            disconnector,
            Arc::clone(events.sessions()),
            self.config.drain.policy(),
        );
        let clients = events.sessions().uuids();
        let (done_tx, done_rx) = oneshot::channel();
        let mut drain = tokio::spawn(async move { coordinator.run(&clients, done_tx).await });
        tokio::spawn(async move {
            if let Ok(report) = done_rx.await {
                info!(
                    clients = report.clients,
                    delay_ms = millis(report.delay),
                    "Clients drained, waiting final grace"
                );
            }
        });

        loop {
            tokio::select! {
                _ = &mut drain => break,
                Some(event) = event_rx.recv() => events.handle(vpn, event),
                event = process_rx.recv() => {
                    if let Some(err) = Self::process_event(event) {
                        drain.abort();
                        warn!(instance = %self.instance, "OpenVPN exited while draining");
                        return Err(err);
                    }
                }
            }
        }

        match vpn.status().await {
            Ok(lines) => {
                for line in lines {
                    debug!(target: "openvpn", "{}", line);
                }
            }
            Err(e) => debug!(error = %e, "Final status unavailable"),
        }
        Ok(())
    }

    fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.config.process.kill_grace_ms)
    }

    async fn bring_up(
        &self,
        vpn: &mut VpnManager,
        events: mpsc::UnboundedSender<ManagementEvent>,
    ) -> Result<Arc<ManagementConsole>> {
        let console = vpn.connect_console(events).await?;
        if self.config.vpn.verbose {
            vpn.enable_logging().await?;
        }
        if let Some(interval) = self.config.vpn.bytecount_interval() {
            vpn.set_bytecount(interval).await?;
        }
        vpn.release_hold().await?;
        Ok(console)
    }

    /// Logs subprocess output; returns an error once the process is gone.
    fn process_event(event: Option<ProcessEvent>) -> Option<ServerError> {
        match event {
            Some(ProcessEvent::Output { stream, line }) => {
                info!(target: "openvpn", stream = ?stream, "{}", line);
                None
            }
            Some(ProcessEvent::Error(reason)) => {
                error!(reason = %reason, "OpenVPN process error");
                None
            }
            Some(ProcessEvent::Exited(info)) => Some(ServerError::ProcessExited {
                status: info.to_string(),
            }),
            None => Some(ServerError::ProcessExited {
                status: "supervision ended".to_string(),
            }),
        }
    }

    /// Triggers shutdown of background tasks.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl std::fmt::Debug for GatewayWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayWorker")
            .field("instance", &self.instance)
            .field("service_id", &self.service_id)
            .finish_non_exhaustive()
    }
}

// ============================================
// ProxyWorker
// ============================================

/// Tunnel proxy listening on the connect and forward ports.
pub struct ProxyWorker {
    config: GatewayConfig,
    instance: InstanceId,
    service_id: Option<ServiceId>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProxyWorker {
    /// Creates a worker. Without `service_id` it registers on start.
    pub fn new(config: GatewayConfig, instance: InstanceId, service_id: Option<ServiceId>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            instance,
            service_id,
            shutdown_tx,
        }
    }

    /// Serves tunnels until SIGTERM/SIGINT.
    ///
    /// # Errors
    /// Configuration, registration and bind errors.
    pub async fn run(&self) -> Result<()> {
        info!(instance = %self.instance, "Starting vpngate proxy v{}", env!("CARGO_PKG_VERSION"));
        let client = Arc::new(ControlPlaneClient::new(self.config.control_plane.clone())?);
        let service_id = resolve_service_id(&client, self.service_id).await?;

        let router = Arc::new(TunnelRouter::new(
            TunnelSettings::from_config(&self.config.proxy, service_id),
            client,
            Arc::new(SystemResolver),
            Arc::new(TracingErrorReporter),
        ));

        let mut tasks = Vec::new();
        for port in [self.config.proxy.connect_port, self.config.proxy.forward_port] {
            let listener = Self::bind(port)?;
            tasks.push(tokio::spawn(Arc::clone(&router).serve(listener, self.shutdown_tx.subscribe())));
        }
        info!(instance = %self.instance, service_id = %service_id, "Proxy ready");

        shutdown_signal().await;
        let _ = self.shutdown_tx.send(());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Tunnel listener task failed");
            }
        }
        info!(instance = %self.instance, "Proxy shutdown complete");
        Ok(())
    }

    /// Binds with `SO_REUSEPORT` so every proxy worker on the host shares the port.
    fn bind(port: u16) -> Result<TcpListener> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listen = || -> std::io::Result<TcpListener> {
            let socket = TcpSocket::new_v4()?;
            socket.set_reuseaddr(true)?;
            socket.set_reuseport(true)?;
            socket.bind(addr)?;
            socket.listen(1024)
        };
        listen().map_err(|e| ServerError::startup_failed(format!("cannot listen on {addr}: {e}")))
    }

    /// Stops the listeners.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl std::fmt::Debug for ProxyWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyWorker")
            .field("instance", &self.instance)
            .field("connect_port", &self.config.proxy.connect_port)
            .field("forward_port", &self.config.proxy.forward_port)
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================
