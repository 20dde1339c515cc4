// ============================================
// File: crates/vpngate-server/src/config.rs
// ============================================
//! # Gateway Configuration
//!
//! ## Creation Reason
//! One TOML file configures every worker on a gateway host. Per-worker
//! values (ports, subnet, pid file) are derived from the instance id
//! given on the command line, so all workers can share the file.
//!
//! ## Main Functionality
//! - `GatewayConfig`: main configuration structure
//! - TOML file loading and parsing
//! - Configuration validation
//! - Per-instance derivations (subnet, ports, backend name)
//!
//! ## Configuration Sections
//! - `vpn`: address block, ports, OpenVPN paths and scripts
//! - `process`: startup probe and orphan reaping timings
//! - `proxy`: tunnel listener ports and limits
//! - `drain`: shutdown pacing
//! - `haproxy`: load-balancer control socket
//! - `control_plane`: API endpoint and credentials
//! - `logging`: log level
//!
//! ## Example Configuration
//! ```toml
//! [vpn]
//! base_subnet = "100.64.0.0/10"
//! instance_count = 4
//! base_port = 10000
//! base_management_port = 11000
//! bytecount_interval_secs = 60
//!
//! [proxy]
//! connect_port = 3128
//!
//! [drain]
//! sigterm_timeout_ms = 120000
//!
//! [control_plane]
//! api_url = "https://api.balena-cloud.com"
//! api_key = "..."
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - All config changes require a worker restart
//! - Ports are `base + instance id`, so instance ids start at 1 and the
//!   base ports themselves are never bound
//!
//! ## Last Modified
//! v0.3.0 - Gateway configuration

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::info;

use vpngate_common::InstanceId;
use vpngate_core::subnet::{Subnet, SubnetAllocator};
use vpngate_transport::ReapPolicy;

use crate::error::{Result, ServerError};
use crate::management::ControlPlaneConfig;
use crate::services::drain::DrainPolicy;

/// Default shutdown budget for draining clients.
pub const DEFAULT_SIGTERM_TIMEOUT_MS: u64 = 120_000;

// ============================================
// GatewayConfig
// ============================================

/// Main gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// OpenVPN instance settings.
    #[serde(default)]
    pub vpn: VpnConfig,

    /// Subprocess supervision timings.
    #[serde(default)]
    pub process: ProcessConfig,

    /// Tunnel proxy settings.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Shutdown draining.
    #[serde(default)]
    pub drain: DrainConfig,

    /// Load-balancer control socket.
    #[serde(default)]
    pub haproxy: HaproxyConfig,

    /// Control-plane API.
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    /// Returns error if file cannot be read, parsed or validated.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.display().to_string();

        info!("Loading configuration from: {}", path_str);

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ServerError::config_load(&path_str, e.to_string()))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ServerError::config_load(&path_str, e.to_string()))?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Loads configuration from a string (useful for testing).
    ///
    /// # Errors
    /// Returns error if the content cannot be parsed or validated.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ServerError::config_load("<string>", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// `ConfigInvalid` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        self.vpn.validate()?;
        self.process.validate()?;
        self.proxy.validate()?;
        self.drain.validate()?;
        self.haproxy.validate()?;

        self.control_plane
            .validate()
            .map_err(|e| ServerError::config_invalid("control_plane", e))?;

        Ok(())
    }

    /// Checks that `instance` fits this configuration.
    ///
    /// # Errors
    /// `ConfigInvalid` if the id exceeds `vpn.instance_count`.
    pub fn check_instance(&self, instance: InstanceId) -> Result<()> {
        if instance.get() > self.vpn.instance_count {
            return Err(ServerError::config_invalid(
                "instance",
                format!(
                    "instance {instance} exceeds vpn.instance_count {}",
                    self.vpn.instance_count
                ),
            ));
        }
        Ok(())
    }
}

// ============================================
// VpnConfig
// ============================================

/// How OpenVPN clients are authenticated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuthMode {
    /// `--auth-user-pass-verify` and connect/disconnect scripts.
    #[default]
    Script,
    /// `--management-client-auth`, answered by the worker.
    Management,
}

/// OpenVPN instance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnConfig {
    /// Address block shared by all instances.
    #[serde(default = "default_base_subnet")]
    pub base_subnet: Ipv4Net,

    /// Per-instance prefix length; derived from `instance_count` if unset.
    #[serde(default)]
    pub instance_subnet_bitmask: Option<u8>,

    /// Number of OpenVPN workers on this host.
    #[serde(default = "default_instance_count")]
    pub instance_count: u16,

    /// VPN port of instance N is `base_port + N`.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Management port of instance N is `base_management_port + N`.
    #[serde(default = "default_base_management_port")]
    pub base_management_port: u16,

    /// Bytecount reporting interval; 0 disables.
    #[serde(default)]
    pub bytecount_interval_secs: u32,

    /// Gateway address override; the subnet's first host if unset.
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,

    /// Re-emit every OpenVPN log line, not only warnings and errors.
    #[serde(default)]
    pub verbose: bool,

    /// OpenVPN executable.
    #[serde(default = "default_openvpn_binary")]
    pub openvpn_binary: String,

    /// Working directory for OpenVPN.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// Server config file name inside `config_dir`.
    #[serde(default = "default_config_file")]
    pub config_file: String,

    /// Directory for `server-<id>.pid`.
    #[serde(default = "default_pid_dir")]
    pub pid_dir: PathBuf,

    /// Directory for `server-<id>.status`.
    #[serde(default = "default_status_dir")]
    pub status_dir: PathBuf,

    /// Client authentication mode.
    #[serde(default)]
    pub client_auth: ClientAuthMode,

    /// `--auth-user-pass-verify` script.
    #[serde(default = "default_auth_script")]
    pub auth_script: String,

    /// `--client-connect` script.
    #[serde(default = "default_connect_script")]
    pub connect_script: String,

    /// `--client-disconnect` script.
    #[serde(default = "default_disconnect_script")]
    pub disconnect_script: String,
}

fn default_base_subnet() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(100, 64, 0, 0), 10).unwrap_or_default()
}

fn default_instance_count() -> u16 {
    1
}

fn default_base_port() -> u16 {
    10000
}

fn default_base_management_port() -> u16 {
    11000
}

fn default_openvpn_binary() -> String {
    "/usr/sbin/openvpn".to_string()
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/openvpn")
}

fn default_config_file() -> String {
    "server.conf".to_string()
}

fn default_pid_dir() -> PathBuf {
    PathBuf::from("/var/run/openvpn")
}

fn default_status_dir() -> PathBuf {
    PathBuf::from("/run/openvpn")
}

fn default_auth_script() -> String {
    "scripts/auth.sh".to_string()
}

fn default_connect_script() -> String {
    "scripts/client-connect.sh".to_string()
}

fn default_disconnect_script() -> String {
    "scripts/client-disconnect.sh".to_string()
}

impl VpnConfig {
    fn validate(&self) -> Result<()> {
        if self.instance_count == 0 || self.instance_count > InstanceId::MAX {
            return Err(ServerError::config_invalid(
                "vpn.instance_count",
                format!("must be between 1 and {}", InstanceId::MAX),
            ));
        }

        // Every instance needs its own subnet
        let last = InstanceId::new(self.instance_count)?;
        self.allocator()
            .instance_subnet(last, self.subnet_mask())
            .map_err(|e| {
                if e.is_config_error() {
                    ServerError::Core(e)
                } else {
                    ServerError::config_invalid(
                        "vpn.instance_subnet_bitmask",
                        format!("/{} has no room for {} instances: {e}", self.subnet_mask(), self.instance_count),
                    )
                }
            })?;

        let vpn = port_range(self.base_port, self.instance_count)
            .ok_or_else(|| ServerError::config_invalid("vpn.base_port", "port range exceeds 65535"))?;
        let mgt = port_range(self.base_management_port, self.instance_count).ok_or_else(|| {
            ServerError::config_invalid("vpn.base_management_port", "port range exceeds 65535")
        })?;
        if vpn.0 <= mgt.1 && mgt.0 <= vpn.1 {
            return Err(ServerError::config_invalid(
                "vpn.base_management_port",
                "management ports overlap VPN ports",
            ));
        }

        if self.openvpn_binary.is_empty() {
            return Err(ServerError::config_invalid("vpn.openvpn_binary", "cannot be empty"));
        }
        Ok(())
    }

    /// Allocator over `base_subnet`.
    #[must_use]
    pub fn allocator(&self) -> SubnetAllocator {
        SubnetAllocator::new(self.base_subnet)
    }

    /// Effective per-instance prefix length.
    #[must_use]
    pub fn subnet_mask(&self) -> u8 {
        self.instance_subnet_bitmask
            .unwrap_or_else(|| self.allocator().default_mask(self.instance_count))
    }

    /// Subnet of `instance`.
    ///
    /// # Errors
    /// Mask errors, or an instance beyond the number of subnets.
    pub fn instance_subnet(&self, instance: InstanceId) -> Result<Subnet> {
        Ok(self.allocator().instance_subnet(instance, self.subnet_mask())?)
    }

    /// OpenVPN port of `instance`.
    ///
    /// # Errors
    /// `ConfigInvalid` if the port overflows.
    pub fn vpn_port(&self, instance: InstanceId) -> Result<u16> {
        offset_port(self.base_port, instance, "vpn.base_port")
    }

    /// Management console port of `instance`.
    ///
    /// # Errors
    /// `ConfigInvalid` if the port overflows.
    pub fn management_port(&self, instance: InstanceId) -> Result<u16> {
        offset_port(self.base_management_port, instance, "vpn.base_management_port")
    }

    /// Bytecount interval, `None` when disabled.
    #[must_use]
    pub const fn bytecount_interval(&self) -> Option<u32> {
        match self.bytecount_interval_secs {
            0 => None,
            secs => Some(secs),
        }
    }
}

/// First and last port used by `count` instances.
fn port_range(base: u16, count: u16) -> Option<(u16, u16)> {
    Some((base.checked_add(1)?, base.checked_add(count)?))
}

fn offset_port(base: u16, instance: InstanceId, field: &str) -> Result<u16> {
    base.checked_add(instance.get())
        .ok_or_else(|| ServerError::config_invalid(field, format!("port overflow for instance {instance}")))
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            base_subnet: default_base_subnet(),
            instance_subnet_bitmask: None,
            instance_count: default_instance_count(),
            base_port: default_base_port(),
            base_management_port: default_base_management_port(),
            bytecount_interval_secs: 0,
            gateway: None,
            verbose: false,
            openvpn_binary: default_openvpn_binary(),
            config_dir: default_config_dir(),
            config_file: default_config_file(),
            pid_dir: default_pid_dir(),
            status_dir: default_status_dir(),
            client_auth: ClientAuthMode::default(),
            auth_script: default_auth_script(),
            connect_script: default_connect_script(),
            disconnect_script: default_disconnect_script(),
        }
    }
}

// ============================================
// ProcessConfig
// ============================================

/// Subprocess supervision timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// How long the management port may take to accept connections.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_ms: u64,

    /// Time an orphan may linger before SIGTERM.
    #[serde(default = "default_grace")]
    pub term_grace_ms: u64,

    /// Time after SIGTERM before SIGKILL.
    #[serde(default = "default_grace")]
    pub kill_grace_ms: u64,

    /// Delay between probes.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
}

fn default_startup_timeout() -> u64 {
    5000
}

fn default_grace() -> u64 {
    5000
}

fn default_probe_interval() -> u64 {
    100
}

impl ProcessConfig {
    fn validate(&self) -> Result<()> {
        if self.startup_timeout_ms == 0 {
            return Err(ServerError::config_invalid("process.startup_timeout_ms", "must be > 0"));
        }
        if self.probe_interval_ms == 0 {
            return Err(ServerError::config_invalid("process.probe_interval_ms", "must be > 0"));
        }
        Ok(())
    }

    /// Orphan reaping policy.
    #[must_use]
    pub fn reap_policy(&self) -> ReapPolicy {
        ReapPolicy {
            term_grace: Duration::from_millis(self.term_grace_ms),
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            poll_interval: Duration::from_millis(self.probe_interval_ms),
            ..ReapPolicy::default()
        }
    }

    /// Management port startup timeout.
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Startup probe interval.
    #[must_use]
    pub const fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: default_startup_timeout(),
            term_grace_ms: default_grace(),
            kill_grace_ms: default_grace(),
            probe_interval_ms: default_probe_interval(),
        }
    }
}

// ============================================
// ProxyConfig
// ============================================

/// Tunnel proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Port for client CONNECT requests.
    #[serde(default = "default_connect_port")]
    pub connect_port: u16,

    /// Port peers forward tunnels to.
    #[serde(default = "default_forward_port")]
    pub forward_port: u16,

    /// How long access checks are cached.
    #[serde(default = "default_access_cache_ttl")]
    pub access_cache_ttl_ms: u64,

    /// Largest accepted request head.
    #[serde(default = "default_max_request_head")]
    pub max_request_head_bytes: usize,
}

fn default_connect_port() -> u16 {
    3128
}

fn default_forward_port() -> u16 {
    3127
}

fn default_access_cache_ttl() -> u64 {
    5000
}

fn default_max_request_head() -> usize {
    8192
}

impl ProxyConfig {
    fn validate(&self) -> Result<()> {
        if self.connect_port == 0 {
            return Err(ServerError::config_invalid("proxy.connect_port", "must be > 0"));
        }
        if self.forward_port == 0 {
            return Err(ServerError::config_invalid("proxy.forward_port", "must be > 0"));
        }
        if self.connect_port == self.forward_port {
            return Err(ServerError::config_invalid(
                "proxy.forward_port",
                "must differ from proxy.connect_port",
            ));
        }
        if self.max_request_head_bytes < 256 {
            return Err(ServerError::config_invalid("proxy.max_request_head_bytes", "must be >= 256"));
        }
        Ok(())
    }

    /// Access cache lifetime.
    #[must_use]
    pub const fn access_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.access_cache_ttl_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_port: default_connect_port(),
            forward_port: default_forward_port(),
            access_cache_ttl_ms: default_access_cache_ttl(),
            max_request_head_bytes: default_max_request_head(),
        }
    }
}

// ============================================
// DrainConfig
// ============================================

/// Shutdown draining configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainConfig {
    /// Total time budget for disconnecting clients.
    #[serde(default = "default_sigterm_timeout")]
    pub sigterm_timeout_ms: u64,

    /// Upper bound on the delay between two disconnects.
    #[serde(default = "default_max_drain_delay")]
    pub max_drain_delay_ms: u64,

    /// Wait after draining before the process exits.
    #[serde(default = "default_final_grace")]
    pub final_grace_ms: u64,
}

fn default_sigterm_timeout() -> u64 {
    DEFAULT_SIGTERM_TIMEOUT_MS
}

fn default_max_drain_delay() -> u64 {
    1000
}

fn default_final_grace() -> u64 {
    5000
}

impl DrainConfig {
    fn validate(&self) -> Result<()> {
        if self.max_drain_delay_ms > self.sigterm_timeout_ms {
            return Err(ServerError::config_invalid(
                "drain.max_drain_delay_ms",
                "must not exceed drain.sigterm_timeout_ms",
            ));
        }
        Ok(())
    }

    /// Pacing policy.
    #[must_use]
    pub const fn policy(&self) -> DrainPolicy {
        DrainPolicy {
            budget: Duration::from_millis(self.sigterm_timeout_ms),
            max_delay: Duration::from_millis(self.max_drain_delay_ms),
            final_grace: Duration::from_millis(self.final_grace_ms),
        }
    }
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            sigterm_timeout_ms: default_sigterm_timeout(),
            max_drain_delay_ms: default_max_drain_delay(),
            final_grace_ms: default_final_grace(),
        }
    }
}

// ============================================
// HaproxyConfig
// ============================================

/// Load-balancer control socket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaproxyConfig {
    /// Unix socket of the runtime API.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Backend holding the VPN workers.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Server name prefix inside the backend.
    #[serde(default = "default_server_prefix")]
    pub server_prefix: String,

    /// Address workers register under.
    #[serde(default = "default_register_host")]
    pub register_host: String,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/haproxy.sock")
}

fn default_backend() -> String {
    "vpn-workers".to_string()
}

fn default_server_prefix() -> String {
    "vpn".to_string()
}

fn default_register_host() -> String {
    "127.0.0.1".to_string()
}

impl HaproxyConfig {
    fn validate(&self) -> Result<()> {
        if self.backend.is_empty() || self.backend.contains(char::is_whitespace) {
            return Err(ServerError::config_invalid("haproxy.backend", "must be a single word"));
        }
        if self.server_prefix.contains(char::is_whitespace) {
            return Err(ServerError::config_invalid("haproxy.server_prefix", "cannot contain whitespace"));
        }
        Ok(())
    }

    /// `<backend>/<prefix><id>` as used in runtime API commands.
    #[must_use]
    pub fn server_name(&self, instance: InstanceId) -> String {
        format!("{}/{}{}", self.backend, self.server_prefix, instance)
    }
}

impl Default for HaproxyConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            backend: default_backend(),
            server_prefix: default_server_prefix(),
            register_host: default_register_host(),
        }
    }
}

// ============================================
// LoggingConfig
// ============================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ============================================
// Tests
// ============================================
