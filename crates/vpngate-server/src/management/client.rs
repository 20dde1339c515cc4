// ============================================
// File: crates/vpngate-server/src/management/client.rs
// ============================================
//! # Control Plane API Client
//!
//! ## Creation Reason
//! Every conversation with the control plane goes through one reqwest
//! client with a fixed timeout and a cap on concurrent requests, so a
//! mass reconnect cannot fan out into thousands of sockets.
//!
//! ## Main Functionality
//! - `ControlPlane`: device-state reporting seam (reconciler)
//! - `DeviceDirectory`: device / access / owning-instance lookups (tunnels)
//! - `ClientAuthenticator`: VPN client credential check
//! - `ControlPlaneClient`: reqwest implementation of all three, plus
//!   service registration and heartbeat
//!
//! ## Endpoints
//! ```text
//! POST  /services/vpn/client-{connect,disconnect}   device state batches
//! GET   /services/vpn/auth/<username>               client credential check
//! GET   /v5/device                                  device by uuid
//! POST  /v5/device(<id>)/canAccess                  tunnel permission
//! GET   /v5/service_instance                        owning instance
//! POST  /v5/service_instance                        register
//! PATCH /v5/service_instance(<id>)                  heartbeat
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Device lookups always use the service API key, since the tunnel
//!   request may be unauthenticated. Access and host lookups use the
//!   presented credential when there is one
//! - `can_access` turns every failure into `false`
//!
//! ## Last Modified
//! v0.3.0 - Control-plane client

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use vpngate_common::{DeviceUuid, ServiceId};

use super::config::ControlPlaneConfig;
use super::models::{
    CanAccessRequest, DeviceInfo, DeviceStateReport, IdOnly, ODataList, ServiceInstance,
    ServiceInstanceCreate, ServiceInstanceHeartbeat, VpnHost,
};
use crate::error::{Result, ServerError};

// ============================================
// Traits
// ============================================

/// Destination of device-state batches.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Posts one batch. Only a `200` counts as success.
    async fn report_device_state(&self, report: &DeviceStateReport) -> Result<()>;
}

/// Device directory used to authorize and route tunnels.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Looks a device up by uuid. `None` if it does not exist.
    async fn get_device(&self, uuid: &DeviceUuid) -> Result<Option<DeviceInfo>>;

    /// Whether `credential` may open a tunnel to `port` on `device`.
    async fn can_access(&self, device: &DeviceInfo, port: u16, credential: Option<&[u8]>) -> Result<bool>;

    /// Service instance currently holding the device's VPN session.
    async fn get_device_vpn_host(&self, uuid: &DeviceUuid, credential: Option<&[u8]>) -> Result<Option<VpnHost>>;
}

/// Credential check for VPN clients.
#[async_trait]
pub trait ClientAuthenticator: Send + Sync {
    /// Returns `true` if `password` authorizes `username`.
    async fn authenticate(&self, username: &str, password: &str) -> Result<bool>;
}

// ============================================
// ControlPlaneClient
// ============================================

/// HTTP client for the control-plane API.
pub struct ControlPlaneClient {
    config: ControlPlaneConfig,
    http: Client,
    permits: Arc<Semaphore>,
}

impl ControlPlaneClient {
    /// Creates a client.
    ///
    /// # Errors
    /// `Internal` if the TLS backend cannot be initialised.
    pub fn new(config: ControlPlaneConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .pool_max_idle_per_host(config.max_api_post_workers)
            .build()
            .map_err(|e| ServerError::internal(format!("failed to create HTTP client: {e}")))?;
        let permits = Arc::new(Semaphore::new(config.max_api_post_workers));
        Ok(Self {
            config,
            http,
            permits,
        })
    }

    /// Client configuration.
    #[must_use]
    pub const fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url())
    }

    fn bearer(&self, credential: Option<&[u8]>) -> String {
        match credential {
            Some(credential) => String::from_utf8_lossy(credential).into_owned(),
            None => self.config.api_key.clone(),
        }
    }

    /// Sends `request` while holding one of the concurrency permits.
    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ServerError::internal("request semaphore closed"))?;
        request
            .send()
            .await
            .map_err(|e| ServerError::upstream(operation, e.to_string()))
    }

    async fn json<T: DeserializeOwned>(operation: &str, response: Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            return Err(ServerError::upstream_status(operation, status.as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| ServerError::upstream(operation, format!("invalid response body: {e}")))
    }

    /// Registers this gateway as a service instance.
    ///
    /// # Errors
    /// `UpstreamApi` on transport failure or non-2xx status.
    pub async fn register_service(&self) -> Result<ServiceId> {
        let body = ServiceInstanceCreate {
            ip_address: self.config.service_address.clone(),
        };
        let request = self
            .http
            .post(self.url("/v5/service_instance"))
            .bearer_auth(&self.config.api_key)
            .json(&body);
        let response = self.send("service registration", request).await?;
        let instance: ServiceInstance = Self::json("service registration", response).await?;
        info!(service_id = %instance.id, "Registered as a service instance");
        Ok(instance.id)
    }

    /// Marks the service instance alive.
    ///
    /// # Errors
    /// `UpstreamApi` on transport failure or non-2xx status.
    pub async fn heartbeat(&self, service_id: ServiceId) -> Result<()> {
        let request = self
            .http
            .patch(self.url(&format!("/v5/service_instance({service_id})")))
            .bearer_auth(&self.config.api_key)
            .json(&ServiceInstanceHeartbeat { is_alive: true });
        let response = self.send("heartbeat", request).await?;
        if !response.status().is_success() {
            return Err(ServerError::upstream_status("heartbeat", response.status().as_u16()));
        }
        debug!(service_id = %service_id, "Heartbeat sent");
        Ok(())
    }
}

/// OData string literal escaping.
fn odata_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[async_trait]
impl ControlPlane for ControlPlaneClient {
    async fn report_device_state(&self, report: &DeviceStateReport) -> Result<()> {
        let event = if report.connected { "connect" } else { "disconnect" };
        let operation = format!("client-{event}");
        let request = self
            .http
            .post(self.url(&format!("/services/vpn/client-{event}")))
            .bearer_auth(&self.config.api_key)
            .json(report);
        let response = self.send(&operation, request).await?;
        if response.status() != StatusCode::OK {
            return Err(ServerError::upstream_status(operation, response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceDirectory for ControlPlaneClient {
    async fn get_device(&self, uuid: &DeviceUuid) -> Result<Option<DeviceInfo>> {
        let filter = format!("uuid eq {}", odata_quote(uuid.as_str()));
        let request = self
            .http
            .get(self.url("/v5/device"))
            .query(&[("$select", "id,is_connected_to_vpn"), ("$filter", filter.as_str())])
            .bearer_auth(&self.config.api_key);
        let response = self.send("device lookup", request).await?;
        let list: ODataList<DeviceInfo> = Self::json("device lookup", response).await?;
        Ok(list.d.into_iter().next())
    }

    async fn can_access(&self, device: &DeviceInfo, port: u16, credential: Option<&[u8]>) -> Result<bool> {
        let request = self
            .http
            .post(self.url(&format!("/v5/device({})/canAccess", device.id)))
            .bearer_auth(self.bearer(credential))
            .json(&CanAccessRequest::tunnel(port));
        let result = match self.send("access check", request).await {
            Ok(response) => Self::json::<ODataList<IdOnly>>("access check", response).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(list) => Ok(list.d.len() == 1 && list.d[0].id == device.id),
            Err(e) => {
                debug!(device_id = device.id, port, error = %e, "Access check failed, denying");
                Ok(false)
            }
        }
    }

    async fn get_device_vpn_host(&self, uuid: &DeviceUuid, credential: Option<&[u8]>) -> Result<Option<VpnHost>> {
        let filter = format!(
            "manages__device/any(d:d/uuid eq {} and d/is_connected_to_vpn eq true)",
            odata_quote(uuid.as_str())
        );
        let request = self
            .http
            .get(self.url("/v5/service_instance"))
            .query(&[("$select", "id,ip_address"), ("$filter", filter.as_str())])
            .bearer_auth(self.bearer(credential));
        let response = self.send("vpn host lookup", request).await?;
        let list: ODataList<VpnHost> = Self::json("vpn host lookup", response).await?;
        Ok(list.d.into_iter().next())
    }
}

#[async_trait]
impl ClientAuthenticator for ControlPlaneClient {
    async fn authenticate(&self, username: &str, password: &str) -> Result<bool> {
        let request = self
            .http
            .get(self.url(&format!("/services/vpn/auth/{username}")))
            .bearer_auth(password);
        match self.send("client auth", request).await {
            Ok(response) if response.status() == StatusCode::OK => Ok(true),
            Ok(response) => {
                info!(username, status = response.status().as_u16(), "Client authentication rejected");
                Ok(false)
            }
            Err(e) => {
                warn!(username, error = %e, "Client authentication request failed");
                Ok(false)
            }
        }
    }
}

impl fmt::Debug for ControlPlaneClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlPlaneClient")
            .field("api_url", &self.config.api_url)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

// ============================================
// Tests
// ============================================
