//! Payloads exchanged during the hello / hello-ok handshake.

use crate::{PresenceEntry, ProtocolMismatch, ProtocolRange, StateVersion};
use serde::{Deserialize, Serialize};

/// Credential presented in hello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAuth {
    pub token: String,
}

/// Server identity reported in hello-ok.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Server-assigned id for this connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_id: Option<String>,
}

/// Methods and events the server advertises.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

impl Features {
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    pub fn has_event(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }
}

/// Access policy and limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
    /// Heartbeat cadence the server uses, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

/// Full server state at handshake time.
///
/// Only `presence` and `state_version` are interpreted here; everything else
/// is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub presence: Vec<PresenceEntry>,
    #[serde(default)]
    pub state_version: StateVersion,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

/// Long-lived device credential issued by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthGrant {
    pub device_token: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub issued_at_ms: i64,
}

/// Successful handshake reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    pub protocol: u32,
    pub server: ServerInfo,
    #[serde(default)]
    pub features: Features,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub snapshot: Snapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthGrant>,
}

impl HelloOk {
    /// Verify the negotiated protocol against what the client supports.
    pub fn check_protocol(&self, range: &ProtocolRange) -> Result<u32, ProtocolMismatch> {
        range.accept(self.protocol)
    }
}

/// Rejection reason in hello-error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloRejection {
    pub code: String,
    pub message: String,
}

impl HelloRejection {
    /// Codes the server uses when the presented credential is not accepted.
    pub const AUTH_CODES: &'static [&'static str] =
        &["unauthorized", "auth_failed", "token_invalid", "token_revoked", "pairing_required"];

    /// Whether the rejection concerns credentials rather than compatibility.
    pub fn is_auth(&self) -> bool {
        Self::AUTH_CODES.contains(&self.code.as_str())
    }
}
