//! Core types for the Hearth gateway protocol.
//!
//! This crate provides the wire envelope, the handshake payloads and the pure
//! state primitives (presence, state versions, leader election). It performs
//! no I/O; `hearth-client` drives these over a socket.

mod handshake;
mod identity;
mod leader;
mod message;
mod presence;
mod url;
mod version;

pub use handshake::{
    AuthGrant, Features, HelloAuth, HelloOk, HelloRejection, Policy, ServerInfo, Snapshot,
};
pub use identity::{
    ClientInfo, DeviceIdentity, PROTOCOL_VERSION, ProtocolMismatch, ProtocolRange,
    StaticDeviceIdentity,
};
pub use leader::{DEFAULT_PROMOTION_THRESHOLD, FollowerWatch, Role, elect_leader, should_promote};
pub use message::{ClientFrame, ErrorShape, Event, Response, ServerFrame};
pub use presence::{PresenceEntry, PresenceTracker, PresenceUpdate};
pub use url::{GatewayUrl, GatewayUrlError};
pub use version::{StateVersion, VersionAnomaly, VersionTracker};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected; initial and terminal state.
    #[default]
    Disconnected,
    /// Opening the socket or waiting for hello-ok.
    Connecting,
    /// Handshake complete; requests are allowed.
    Connected,
    /// Socket lost, waiting to retry.
    Reconnecting,
    /// Fatal failure; needs caller action before connecting again.
    Error,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}
