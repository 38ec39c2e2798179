//! Client identity sent with every hello.
//!
//! The device identifier is stable across process restarts and is supplied by
//! a [`DeviceIdentity`] provider living outside this crate. The instance
//! identifier is fresh per process and distinguishes several clients running
//! on behalf of the same account.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version this crate speaks.
pub const PROTOCOL_VERSION: u32 = 3;

/// Supplies the stable device identifier.
pub trait DeviceIdentity: Send + Sync {
    fn device_id(&self) -> String;
}

/// A device identity that is known up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticDeviceIdentity(pub String);

impl DeviceIdentity for StaticDeviceIdentity {
    fn device_id(&self) -> String {
        self.0.clone()
    }
}

/// Inclusive range of protocol versions a client accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolRange {
    pub min: u32,
    pub max: u32,
}

impl ProtocolRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// Check a server-negotiated version against this range.
    pub fn accept(&self, negotiated: u32) -> Result<u32, ProtocolMismatch> {
        if (self.min..=self.max).contains(&negotiated) {
            Ok(negotiated)
        } else {
            Err(ProtocolMismatch {
                negotiated,
                range: *self,
            })
        }
    }
}

impl Default for ProtocolRange {
    fn default() -> Self {
        Self::new(PROTOCOL_VERSION, PROTOCOL_VERSION)
    }
}

impl fmt::Display for ProtocolRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}..={}", self.min, self.max)
        }
    }
}

/// The server picked a protocol version outside the client's range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("server negotiated protocol {negotiated}, client supports {range}")]
pub struct ProtocolMismatch {
    pub negotiated: u32,
    pub range: ProtocolRange,
}

/// Static identity of this client process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub device_id: String,
    /// Unique per process; used for presence and leader election.
    pub instance_id: String,
    pub display_name: String,
    pub platform: String,
    pub version: String,
    pub protocol: ProtocolRange,
}

impl ClientInfo {
    /// Build client info for the given device, generating a fresh instance id.
    pub fn new(device: &dyn DeviceIdentity, display_name: impl Into<String>) -> Self {
        Self {
            device_id: device.device_id(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            display_name: display_name.into(),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: ProtocolRange::default(),
        }
    }

    /// Override the instance id (tests, or a host that persists it).
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolRange) -> Self {
        self.protocol = protocol;
        self
    }
}
