// ============================================
// File: crates/vpngate-server/src/management/config.rs
// ============================================
//! # Control Plane Configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Control-plane API settings (`[control_plane]`).
#[derive(Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// API base URL, without trailing slash.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Service bearer token.
    #[serde(default)]
    pub api_key: String,

    /// HTTP request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum concurrent outbound API requests.
    #[serde(default = "default_max_api_post_workers")]
    pub max_api_post_workers: usize,

    /// Maximum uuids per device-state request body.
    #[serde(default = "default_device_state_batch_size")]
    pub device_state_batch_size: usize,

    /// Minimum delay between reconciliation passes while work is pending.
    #[serde(default = "default_retry_floor")]
    pub retry_floor_ms: u64,

    /// Service instance heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// IP address reported when registering the service instance.
    #[serde(default = "default_service_address")]
    pub service_address: String,
}

fn default_api_url() -> String {
    "https://api.balena-cloud.com".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_api_post_workers() -> usize {
    20
}

fn default_device_state_batch_size() -> usize {
    8000
}

fn default_retry_floor() -> u64 {
    1000
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_service_address() -> String {
    "127.0.0.1".to_string()
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: String::new(),
            request_timeout_secs: default_request_timeout(),
            max_api_post_workers: default_max_api_post_workers(),
            device_state_batch_size: default_device_state_batch_size(),
            retry_floor_ms: default_retry_floor(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            service_address: default_service_address(),
        }
    }
}

impl ControlPlaneConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.api_url.is_empty() {
            return Err("api_url cannot be empty".to_string());
        }
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            return Err("api_url must be an http(s) URL".to_string());
        }
        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be > 0".to_string());
        }
        if self.max_api_post_workers == 0 {
            return Err("max_api_post_workers must be > 0".to_string());
        }
        if self.device_state_batch_size == 0 {
            return Err("device_state_batch_size must be > 0".to_string());
        }
        if self.heartbeat_interval_secs == 0 {
            return Err("heartbeat_interval_secs must be > 0".to_string());
        }
        if self.service_address.parse::<std::net::IpAddr>().is_err() {
            return Err("service_address must be an IP address".to_string());
        }
        Ok(())
    }

    /// Base URL with any trailing slash removed.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }

    /// Request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Retry floor between reconciliation passes.
    #[must_use]
    pub const fn retry_floor(&self) -> Duration {
        Duration::from_millis(self.retry_floor_ms)
    }

    /// Heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl std::fmt::Debug for ControlPlaneConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_api_post_workers", &self.max_api_post_workers)
            .field("device_state_batch_size", &self.device_state_batch_size)
            .field("retry_floor_ms", &self.retry_floor_ms)
            .field("heartbeat_interval_secs", &self.heartbeat_interval_secs)
            .field("service_address", &self.service_address)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ControlPlaneConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = ControlPlaneConfig::default();
        config.api_url = "ftp://x".into();
        assert!(config.validate().is_err());

        let mut config = ControlPlaneConfig::default();
        config.device_state_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = ControlPlaneConfig::default();
        config.service_address = "not-an-ip".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let config = ControlPlaneConfig {
            api_key: "secret-token".into(),
            ..ControlPlaneConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret-token"));
        assert_eq!(config.base_url(), "https://api.balena-cloud.com");
    }
}
