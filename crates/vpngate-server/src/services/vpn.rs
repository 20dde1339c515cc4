// ============================================
// File: crates/vpngate-server/src/services/vpn.rs
// ============================================
//! # VPN Process Manager
//!
//! ## Creation Reason
//! Each gateway worker owns exactly one OpenVPN server process and the
//! management console that controls it. This module brings the process
//! up safely (orphan reap, held start, port probe) and exposes the
//! console commands the worker needs.
//!
//! ## Main Functionality
//! - `VpnInstanceSpec`: per-instance ports, paths and command line
//! - `VpnManager`: lifecycle state machine plus console commands
//!
//! ## Lifecycle
//! ```text
//! ┌─────────┐ start()  ┌──────────┐ connect_console()  ┌──────────┐
//! │ Stopped │ ───────► │ Starting │ ─ release_hold() ─►│ Running  │
//! └─────────┘          └────┬─────┘                    └────┬─────┘
//!      ▲   reap / spawn /   │                               │ stop()
//!      │   probe failure    │                               ▼
//!      └────────────────────┘                          ┌──────────┐
//!      ▲                                               │ Stopping │
//!      └───────────────────────────────────────────────┴──────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - OpenVPN is started with `--management-hold`: it serves nobody until
//!   `release_hold()`, so the worker can subscribe to events first
//! - The manager never restarts OpenVPN. An exit is fatal to the worker
//!   and the external supervisor restarts it
//! - Console commands are not timed out here
//!
//! ## Last Modified
//! v0.3.0 - OpenVPN process manager

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vpngate_common::InstanceId;
use vpngate_core::subnet::Subnet;
use vpngate_core::ManagementEvent;
use vpngate_transport::process::{reap_orphan, spawn_process, wait_for_port};
use vpngate_transport::{ManagementCommand, ManagementConsole, ProcessEvent, ProcessHandle, ReapPolicy, TransportError};

use crate::config::{ClientAuthMode, GatewayConfig};
use crate::error::{Result, ServerError};

// ============================================
// VpnInstanceSpec
// ============================================

/// Everything needed to launch one OpenVPN instance.
#[derive(Debug, Clone)]
pub struct VpnInstanceSpec {
    /// Worker index
    pub instance: InstanceId,
    /// Address block of this instance
    pub subnet: Subnet,
    /// Gateway override
    pub gateway: Option<Ipv4Addr>,
    /// Client-facing port
    pub vpn_port: u16,
    /// Management console port (loopback)
    pub management_port: u16,
    /// OpenVPN executable
    pub openvpn_binary: String,
    /// OpenVPN working directory
    pub config_dir: PathBuf,
    /// Config file name inside `config_dir`
    pub config_file: String,
    /// Pid file directory
    pub pid_dir: PathBuf,
    /// Status file directory
    pub status_dir: PathBuf,
    /// Client authentication mode
    pub client_auth: ClientAuthMode,
    /// Auth script
    pub auth_script: String,
    /// Client connect script
    pub connect_script: String,
    /// Client disconnect script
    pub disconnect_script: String,
}

impl VpnInstanceSpec {
    /// Derives the spec of `instance` from the gateway configuration.
    ///
    /// # Errors
    /// Configuration errors for an instance that does not fit.
    pub fn from_config(config: &GatewayConfig, instance: InstanceId) -> Result<Self> {
        config.check_instance(instance)?;
        let vpn = &config.vpn;
        Ok(Self {
            instance,
            subnet: vpn.instance_subnet(instance)?,
            gateway: vpn.gateway,
            vpn_port: vpn.vpn_port(instance)?,
            management_port: vpn.management_port(instance)?,
            openvpn_binary: vpn.openvpn_binary.clone(),
            config_dir: vpn.config_dir.clone(),
            config_file: vpn.config_file.clone(),
            pid_dir: vpn.pid_dir.clone(),
            status_dir: vpn.status_dir.clone(),
            client_auth: vpn.client_auth,
            auth_script: vpn.auth_script.clone(),
            connect_script: vpn.connect_script.clone(),
            disconnect_script: vpn.disconnect_script.clone(),
        })
    }

    /// `<pid_dir>/server-<id>.pid`
    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.pid_dir.join(format!("server-{}.pid", self.instance))
    }

    /// `<status_dir>/server-<id>.status`
    #[must_use]
    pub fn status_file(&self) -> PathBuf {
        self.status_dir.join(format!("server-{}.status", self.instance))
    }

    /// Loopback address of the management console.
    #[must_use]
    pub fn management_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.management_port))
    }

    /// Tunnel-side address of the server.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway.unwrap_or_else(|| self.subnet.first())
    }

    /// OpenVPN command line.
    #[must_use]
    pub fn openvpn_args(&self) -> Vec<String> {
        let id = self.instance;
        let gateway = self.gateway().to_string();
        let mut args: Vec<String> = vec![
            "--writepid".into(),
            self.pid_file().display().to_string(),
            "--status".into(),
            self.status_file().display().to_string(),
            "10".into(),
            "--cd".into(),
            self.config_dir.display().to_string(),
            "--config".into(),
            self.config_dir.join(&self.config_file).display().to_string(),
            "--verb".into(),
            "3".into(),
            "--dev".into(),
            format!("tun{id}"),
            "--txqueuelen".into(),
            "1000".into(),
            "--port".into(),
            self.vpn_port.to_string(),
            "--management".into(),
            Ipv4Addr::LOCALHOST.to_string(),
            self.management_port.to_string(),
            "--management-hold".into(),
            "--ifconfig".into(),
            gateway.clone(),
            self.subnet.second().to_string(),
            "--ifconfig-pool".into(),
            self.subnet.third().to_string(),
            self.subnet.last().to_string(),
            "--route".into(),
            self.subnet.network().to_string(),
            self.subnet.netmask().to_string(),
            "--push".into(),
            format!("route {gateway}"),
        ];

        match self.client_auth {
            ClientAuthMode::Script => args.extend([
                "--auth-user-pass-verify".into(),
                format!("{} {id}", self.auth_script),
                "via-env".into(),
                "--client-connect".into(),
                format!("{} {id}", self.connect_script),
                "--client-disconnect".into(),
                format!("{} {id}", self.disconnect_script),
            ]),
            ClientAuthMode::Management => args.push("--management-client-auth".into()),
        }
        args
    }
}

// ============================================
// VpnState
// ============================================

/// Process lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnState {
    /// No process.
    Stopped,
    /// Process spawned and held, console not yet released.
    Starting,
    /// Serving clients.
    Running,
    /// Shutting the process down.
    Stopping,
}

impl VpnState {
    /// Lowercase name for errors and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

// ============================================
// VpnManager
// ============================================

/// Owner of one OpenVPN process and its management console.
pub struct VpnManager {
    spec: VpnInstanceSpec,
    reap: ReapPolicy,
    startup_timeout: Duration,
    probe_interval: Duration,
    state: VpnState,
    process: Option<ProcessHandle>,
    console: Option<Arc<ManagementConsole>>,
}

impl VpnManager {
    /// Creates a stopped manager.
    #[must_use]
    pub fn new(spec: VpnInstanceSpec, reap: ReapPolicy, startup_timeout: Duration, probe_interval: Duration) -> Self {
        Self {
            spec,
            reap,
            startup_timeout,
            probe_interval,
            state: VpnState::Stopped,
            process: None,
            console: None,
        }
    }

    /// Builds a manager for `instance` from the gateway configuration.
    ///
    /// # Errors
    /// Configuration errors from [`VpnInstanceSpec::from_config`].
    pub fn from_config(config: &GatewayConfig, instance: InstanceId) -> Result<Self> {
        Ok(Self::new(
            VpnInstanceSpec::from_config(config, instance)?,
            config.process.reap_policy(),
            config.process.startup_timeout(),
            config.process.probe_interval(),
        ))
    }

    #[cfg(test)]
    pub(crate) fn with_console(config: &GatewayConfig, instance: InstanceId, console: Arc<ManagementConsole>) -> Result<Self> {
        let mut manager = Self::from_config(config, instance)?;
        manager.console = Some(console);
        Ok(manager)
    }

    /// Instance spec.
    #[must_use]
    pub const fn spec(&self) -> &VpnInstanceSpec {
        &self.spec
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> VpnState {
        self.state
    }

    /// OS pid of the OpenVPN process.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ProcessHandle::pid)
    }

    fn expect_state(&self, expected: VpnState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ServerError::InvalidState {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            })
        }
    }

    /// Reaps any orphan, spawns OpenVPN held, and waits for its console.
    ///
    /// Process output and exit are reported on `events`.
    ///
    /// # Errors
    /// `ProcessStartupFailure` if any step fails; the manager is back in
    /// `Stopped` afterwards.
    pub async fn start(&mut self, events: mpsc::UnboundedSender<ProcessEvent>) -> Result<()> {
        self.expect_state(VpnState::Stopped)?;
        self.state = VpnState::Starting;
        info!(
            instance = %self.spec.instance,
            subnet = %self.spec.subnet.as_net(),
            port = self.spec.vpn_port,
            management_port = self.spec.management_port,
            "Starting OpenVPN"
        );

        match self.launch(events).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(process) = self.process.take() {
                    let _ = process.kill();
                }
                self.state = VpnState::Stopped;
                Err(ServerError::startup_failed(e.to_string()))
            }
        }
    }

    async fn launch(&mut self, events: mpsc::UnboundedSender<ProcessEvent>) -> std::result::Result<(), TransportError> {
        reap_orphan(&self.spec.pid_file(), &self.reap).await?;

        let args = self.spec.openvpn_args();
        debug!(args = ?args, "OpenVPN command line");
        self.process = Some(spawn_process(&self.spec.openvpn_binary, &args, events)?);

        wait_for_port(self.spec.management_addr(), self.startup_timeout, self.probe_interval).await
    }

    /// Connects the management console. Parsed notifications go to `events`.
    ///
    /// # Errors
    /// `InvalidState` unless starting, or a transport error.
    pub async fn connect_console(&mut self, events: mpsc::UnboundedSender<ManagementEvent>) -> Result<Arc<ManagementConsole>> {
        self.expect_state(VpnState::Starting)?;
        let console = Arc::new(ManagementConsole::connect(self.spec.management_addr(), events).await?);
        self.console = Some(Arc::clone(&console));
        Ok(console)
    }

    /// The connected console, if any.
    #[must_use]
    pub fn console(&self) -> Option<Arc<ManagementConsole>> {
        self.console.clone()
    }

    async fn exec(&self, command: &ManagementCommand) -> Result<Vec<String>> {
        let console = self.console.as_ref().ok_or(TransportError::NotConnected)?;
        debug!(command = %command, "Management command");
        Ok(console.exec(command).await?)
    }

    /// `log on all`
    ///
    /// # Errors
    /// Console errors.
    pub async fn enable_logging(&self) -> Result<()> {
        self.exec(&ManagementCommand::LogOnAll).await.map(|_| ())
    }

    /// `bytecount <secs>`; 0 disables.
    ///
    /// # Errors
    /// Console errors.
    pub async fn set_bytecount(&self, interval_secs: u32) -> Result<()> {
        self.exec(&ManagementCommand::ByteCount(interval_secs)).await.map(|_| ())
    }

    /// `hold release`; the instance is running afterwards.
    ///
    /// # Errors
    /// `InvalidState` unless starting, or console errors.
    pub async fn release_hold(&mut self) -> Result<()> {
        self.expect_state(VpnState::Starting)?;
        self.exec(&ManagementCommand::HoldRelease).await?;
        self.state = VpnState::Running;
        info!(instance = %self.spec.instance, "OpenVPN running");
        Ok(())
    }

    /// `status`
    ///
    /// # Errors
    /// Console errors.
    pub async fn status(&self) -> Result<Vec<String>> {
        self.exec(&ManagementCommand::Status).await
    }

    /// Closes the console and stops the process, escalating to SIGKILL
    /// after `grace`.
    pub async fn stop(&mut self, grace: Duration) {
        if self.state == VpnState::Stopped {
            return;
        }
        self.state = VpnState::Stopping;
        self.console = None;

        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.terminate() {
                warn!(error = %e, "Failed to terminate OpenVPN");
            }
            if tokio::time::timeout(grace, process.wait()).await.is_err() {
                warn!(instance = %self.spec.instance, "OpenVPN ignored SIGTERM, killing");
                let _ = process.kill();
                let _ = process.wait().await;
            }
        }

        self.state = VpnState::Stopped;
        info!(instance = %self.spec.instance, "OpenVPN stopped");
    }
}

impl std::fmt::Debug for VpnManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VpnManager")
            .field("instance", &self.spec.instance)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .field("console", &self.console.as_ref().map(|c| c.addr()))
            .finish()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    fn config(toml: &str) -> GatewayConfig {
        GatewayConfig::from_str(toml).unwrap()
    }

    #[test]
    fn test_openvpn_args_script_mode() {
        let config = config(
            r#"
            [vpn]
            base_subnet = "10.240.0.0/16"
            instance_count = 4
        "#,
        );
        let spec = VpnInstanceSpec::from_config(&config, InstanceId::new(2).unwrap()).unwrap();
        let args = spec.openvpn_args();
        let joined = args.join(" ");

        assert_eq!(spec.subnet.network(), Ipv4Addr::new(10, 240, 64, 0));
        assert!(joined.starts_with("--writepid /var/run/openvpn/server-2.pid --status /run/openvpn/server-2.status 10"));
        assert!(joined.contains("--config /etc/openvpn/server.conf"));
        assert!(joined.contains("--dev tun2"));
        assert!(joined.contains("--port 10002"));
        assert!(joined.contains("--management 127.0.0.1 11002 --management-hold"));
        assert!(joined.contains("--ifconfig 10.240.64.1 10.240.64.2"));
        assert!(joined.contains("--ifconfig-pool 10.240.64.3 10.240.127.254"));
        assert!(joined.contains("--route 10.240.64.0 255.255.192.0"));
        assert!(args.contains(&"route 10.240.64.1".to_string()));
        assert!(args.contains(&"scripts/auth.sh 2".to_string()));
        assert!(args.contains(&"scripts/client-disconnect.sh 2".to_string()));
        assert!(!args.contains(&"--management-client-auth".to_string()));
    }

    #[test]
    fn test_openvpn_args_management_auth_and_gateway() {
        let config = config(
            r#"
            [vpn]
            base_subnet = "10.240.0.0/24"
            gateway = "10.240.0.100"
            client_auth = "management"
        "#,
        );
        let spec = VpnInstanceSpec::from_config(&config, InstanceId::new(1).unwrap()).unwrap();
        let args = spec.openvpn_args();
        assert!(args.contains(&"--management-client-auth".to_string()));
        assert!(!args.contains(&"--auth-user-pass-verify".to_string()));
        assert!(args.contains(&"route 10.240.0.100".to_string()));
    }

    #[test]
    fn test_instance_beyond_count_rejected() {
        let config = GatewayConfig::default();
        let err = VpnInstanceSpec::from_config(&config, InstanceId::new(2).unwrap()).unwrap_err();
        assert!(err.is_config_error());
    }

    fn test_manager(binary: &str, management_port: u16, pid_dir: PathBuf) -> VpnManager {
        let mut config = GatewayConfig::default();
        config.vpn.openvpn_binary = binary.to_string();
        config.vpn.pid_dir = pid_dir;
        config.vpn.base_management_port = management_port - 1;
        config.process.startup_timeout_ms = 300;
        config.process.probe_interval_ms = 20;
        VpnManager::from_config(&config, InstanceId::new(1).unwrap()).unwrap()
    }

    /// Console that answers every command like OpenVPN would.
    async fn fake_console(listener: TcpListener, commands: mpsc::UnboundedSender<String>) {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            let commands = commands.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let _ = write.write_all(b">INFO:OpenVPN Management Interface\r\n").await;
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let reply: &[u8] = match line.as_str() {
                        "log on all" | "status" => b"END\r\n",
                        "kill nobody" => b"ERROR: common name 'nobody' not found\r\n",
                        _ => b"SUCCESS: done\r\n",
                    };
                    let _ = commands.send(line);
                    if write.write_all(reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn test_start_connect_and_commands() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(fake_console(listener, cmd_tx));

        // `true` ignores its arguments and exits, the console is faked
        let mut manager = test_manager("true", port, dir.path().to_path_buf());
        let (proc_tx, _proc_rx) = mpsc::unbounded_channel();
        manager.start(proc_tx).await.unwrap();
        assert_eq!(manager.state(), VpnState::Starting);

        assert!(matches!(
            manager.status().await,
            Err(ServerError::Transport(TransportError::NotConnected))
        ));

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        manager.connect_console(event_tx).await.unwrap();
        manager.enable_logging().await.unwrap();
        manager.set_bytecount(10).await.unwrap();
        manager.release_hold().await.unwrap();
        assert_eq!(manager.state(), VpnState::Running);
        assert!(manager.status().await.unwrap().is_empty());
        let console = manager.console().unwrap();
        let err = console
            .exec(&ManagementCommand::Kill("nobody".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::CommandFailed { .. }));

        let mut seen = Vec::new();
        while let Ok(line) = cmd_rx.try_recv() {
            seen.push(line);
        }
        assert_eq!(
            seen,
            vec![
                "log on all",
                "bytecount 10",
                "hold release",
                "status",
                "kill nobody",
            ]
        );
        assert!(matches!(event_rx.recv().await, Some(ManagementEvent::Notification { .. })));

        manager.stop(Duration::from_millis(100)).await;
        assert_eq!(manager.state(), VpnState::Stopped);
    }

    #[tokio::test]
    async fn test_start_fails_when_console_never_listens() {
        let dir = tempfile::tempdir().unwrap();
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut manager = test_manager("true", port, dir.path().to_path_buf());
        let (proc_tx, _proc_rx) = mpsc::unbounded_channel();
        let err = manager.start(proc_tx).await.unwrap_err();
        assert!(matches!(err, ServerError::ProcessStartupFailure { .. }));
        assert!(err.is_fatal());
        assert_eq!(manager.state(), VpnState::Stopped);
    }

    #[tokio::test]
    async fn test_start_fails_for_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = test_manager("/nonexistent/openvpn", 20000, dir.path().to_path_buf());
        let (proc_tx, _proc_rx) = mpsc::unbounded_channel();
        let err = manager.start(proc_tx).await.unwrap_err();
        assert!(matches!(err, ServerError::ProcessStartupFailure { .. }));

        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        assert!(matches!(
            manager.connect_console(event_tx).await,
            Err(ServerError::InvalidState { .. })
        ));
    }
}
