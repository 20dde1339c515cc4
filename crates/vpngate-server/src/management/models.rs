// ============================================
// File: crates/vpngate-server/src/management/models.rs
// ============================================
//! # Control Plane Data Models
//!
//! Request and response bodies exchanged with the control-plane API.
//!
//! ## Main Data Structures
//! - `DeviceStateReport`: batched connect/disconnect body
//! - `DeviceInfo` / `VpnHost`: device directory lookups
//! - `ODataList`: the `{ "d": [...] }` envelope of resource queries
//! - `ServiceInstance*`: registration and heartbeat
//!
//! ## ⚠️ Important Note for Next Developer
//! - `DeviceStateReport` is camelCase on the wire (`serviceId`), resource
//!   models are snake_case. Do not add a blanket `rename_all`
//!
//! ## Last Modified
//! v0.3.0 - Control-plane models

use serde::{Deserialize, Serialize};

use vpngate_common::{DeviceUuid, ServiceId};

// ============================================
// Device State
// ============================================

/// Body of `POST /services/vpn/client-{connect,disconnect}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStateReport {
    /// Reporting service instance
    #[serde(rename = "serviceId")]
    pub service_id: ServiceId,
    /// Devices whose state changed
    pub uuids: Vec<DeviceUuid>,
    /// New connection state
    pub connected: bool,
}

// ============================================
// Resource Queries
// ============================================

/// `{ "d": [...] }` envelope returned by resource queries.
#[derive(Debug, Clone, Deserialize)]
pub struct ODataList<T> {
    /// Matching rows; absent is treated as empty
    #[serde(default = "Vec::new")]
    pub d: Vec<T>,
}

/// Device row as selected for tunnel authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device database id
    pub id: u64,
    /// Whether any gateway reports the device connected
    #[serde(default)]
    pub is_connected_to_vpn: bool,
}

/// Service instance that currently manages a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnHost {
    /// Service instance id
    pub id: ServiceId,
    /// Reachable address of the instance
    pub ip_address: String,
}

/// Row with only an id, as returned by `canAccess`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct IdOnly {
    /// Resource id
    pub id: u64,
}

/// Body of `POST /v5/device(<id>)/canAccess`.
#[derive(Debug, Clone, Serialize)]
pub struct CanAccessRequest {
    /// Requested permissions
    pub action: CanAccessAction,
}

/// Any-of permission list.
#[derive(Debug, Clone, Serialize)]
pub struct CanAccessAction {
    /// Permissions, any one of which suffices
    pub or: Vec<String>,
}

impl CanAccessRequest {
    /// Tunnel permission check for `port`.
    #[must_use]
    pub fn tunnel(port: u16) -> Self {
        Self {
            action: CanAccessAction {
                or: vec!["tunnel-any".to_string(), format!("tunnel-{port}")],
            },
        }
    }
}

// ============================================
// Service Instance
// ============================================

/// Body of `POST /v5/service_instance`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInstanceCreate {
    /// Address peers use to forward tunnels
    pub ip_address: String,
}

/// Created service instance.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ServiceInstance {
    /// Assigned service id
    pub id: ServiceId,
}

/// Body of the heartbeat `PATCH`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ServiceInstanceHeartbeat {
    /// Always `true`
    pub is_alive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_state_report_wire_format() {
        let report = DeviceStateReport {
            service_id: ServiceId(7),
            uuids: vec![DeviceUuid::new("user2").unwrap()],
            connected: true,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "serviceId": 7, "uuids": ["user2"], "connected": true })
        );
    }

    #[test]
    fn test_odata_list_defaults_to_empty() {
        let list: ODataList<DeviceInfo> = serde_json::from_str("{}").unwrap();
        assert!(list.d.is_empty());

        let list: ODataList<DeviceInfo> =
            serde_json::from_str(r#"{"d":[{"id":1,"is_connected_to_vpn":true}]}"#).unwrap();
        assert_eq!(list.d[0], DeviceInfo { id: 1, is_connected_to_vpn: true });
    }

    #[test]
    fn test_can_access_body() {
        let json = serde_json::to_value(CanAccessRequest::tunnel(22)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "action": { "or": ["tunnel-any", "tunnel-22"] } })
        );
    }
}
