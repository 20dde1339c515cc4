// ============================================
// File: crates/vpngate-common/src/types.rs
// ============================================
//! # Core Type Definitions
//!
//! ## Creation Reason
//! Gives the identifiers that flow between the VPN manager, the
//! reconciler and the tunnel router distinct types, so a numeric
//! OpenVPN client id can never be passed where a service instance id
//! is expected.
//!
//! ## Main Functionality
//! - `DeviceUuid`: device identity (certificate common name)
//! - `ClientId`: ephemeral id OpenVPN assigns to a connection
//! - `InstanceId`: 1-based worker index inside one gateway host
//! - `ServiceId`: control-plane registry id of a gateway process
//!
//! ## ⚠️ Important Note for Next Developer
//! - `DeviceUuid` is NOT required to be hexadecimal: certificate common
//!   names are opaque. Only tunnel hostnames are hex-validated (core crate)
//! - All ids serialize transparently so control-plane payloads stay flat
//!
//! ## Last Modified
//! v0.3.0 - Replaced session identifiers with gateway identifiers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CommonError;

// ============================================
// DeviceUuid
// ============================================

/// Unique device identity, taken from the client certificate common name.
///
/// # Example
/// ```
/// use vpngate_common::types::DeviceUuid;
///
/// let uuid: DeviceUuid = "deadbeef".parse().unwrap();
/// assert!(uuid.is_hex());
/// assert_eq!(uuid.vpn_host(), "deadbeef.vpn");
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceUuid(String);

impl DeviceUuid {
    /// Creates a uuid, rejecting empty values and values containing
    /// whitespace, control characters or the `,`/`"` delimiters used by
    /// the management protocol.
    ///
    /// # Errors
    /// Returns `CommonError::InvalidInput` for rejected values.
    pub fn new(value: impl Into<String>) -> Result<Self, CommonError> {
        let value = value.into();
        if value.is_empty() {
            return Err(CommonError::invalid_input("uuid", "cannot be empty"));
        }
        if value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == ',' || c == '"')
        {
            return Err(CommonError::invalid_input(
                "uuid",
                "contains a forbidden character",
            ));
        }
        Ok(Self(value))
    }

    /// Returns the uuid as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the uuid consists only of hex digits.
    #[must_use]
    pub fn is_hex(&self) -> bool {
        self.0.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// Internal hostname the device resolves to on the gateway that owns
    /// its VPN session.
    #[must_use]
    pub fn vpn_host(&self) -> String {
        format!("{}.vpn", self.0)
    }
}

impl fmt::Debug for DeviceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceUuid({})", self.0)
    }
}

impl fmt::Display for DeviceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceUuid {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for DeviceUuid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================
// ClientId
// ============================================

/// Connection id assigned by OpenVPN; only valid for the lifetime of one
/// OpenVPN process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ClientId {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|e| CommonError::invalid_input("client_id", e.to_string()))
    }
}

// ============================================
// InstanceId
// ============================================

/// 1-based index of a worker process on one gateway host.
///
/// Port numbers, device names and the instance subnet are all derived
/// from it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(u16);

impl InstanceId {
    /// Largest accepted instance index.
    pub const MAX: u16 = 1024;

    /// Creates an instance id.
    ///
    /// # Errors
    /// Returns `CommonError::OutOfRange` when `id` is 0 or above [`Self::MAX`].
    pub fn new(id: u16) -> Result<Self, CommonError> {
        if id == 0 || id > Self::MAX {
            return Err(CommonError::out_of_range(
                "instance",
                i64::from(id),
                1,
                i64::from(Self::MAX),
            ));
        }
        Ok(Self(id))
    }

    /// Returns the raw index.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Zero-based offset used for port and subnet arithmetic.
    #[must_use]
    pub const fn offset(self) -> u16 {
        self.0 - 1
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s
            .trim()
            .parse::<u16>()
            .map_err(|e| CommonError::invalid_input("instance", e.to_string()))?;
        Self::new(id)
    }
}

// ============================================
// ServiceId
// ============================================

/// Registry id of a gateway process in the control plane.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub u64);

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceId({})", self.0)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServiceId {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|e| CommonError::invalid_input("service_id", e.to_string()))
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_uuid_accepts_opaque_names() {
        let uuid = DeviceUuid::new("user2").unwrap();
        assert_eq!(uuid.as_str(), "user2");
        assert!(!uuid.is_hex());
    }

    #[test]
    fn test_device_uuid_rejects_delimiters() {
        assert!(DeviceUuid::new("").is_err());
        assert!(DeviceUuid::new("a b").is_err());
        assert!(DeviceUuid::new("a,b").is_err());
        assert!(DeviceUuid::new("a\"b").is_err());
    }

    #[test]
    fn test_device_uuid_serializes_flat() {
        let uuid = DeviceUuid::new("abc123").unwrap();
        assert_eq!(serde_json::to_string(&uuid).unwrap(), "\"abc123\"");
    }

    #[test]
    fn test_instance_id_bounds() {
        assert!(InstanceId::new(0).is_err());
        assert_eq!(InstanceId::new(1).unwrap().offset(), 0);
        assert_eq!("3".parse::<InstanceId>().unwrap().get(), 3);
        assert!(InstanceId::new(InstanceId::MAX + 1).is_err());
    }

    #[test]
    fn test_client_id_parse() {
        assert_eq!(" 7".parse::<ClientId>().unwrap(), ClientId(7));
        assert!("x".parse::<ClientId>().is_err());
    }
}
