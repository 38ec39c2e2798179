//! Caller-facing errors and connection faults.

use hearth_core::{ConnectionState, ErrorShape, GatewayUrlError, HelloRejection, ProtocolMismatch};
use std::time::Duration;

/// Errors returned to callers of the client handle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("not connected (state: {0})")]
    NotConnected(ConnectionState),
    #[error("request `{method}` timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("connection lost")]
    ConnectionLost,
    #[error("gateway error {code}: {message}")]
    Application {
        code: String,
        message: String,
        details: Option<serde_json::Value>,
    },
    #[error("failed to encode request: {0}")]
    Encode(String),
    #[error("failed to decode result: {0}")]
    Decode(String),
    #[error("client destroyed")]
    Destroyed,
    #[error(transparent)]
    InvalidUrl(#[from] GatewayUrlError),
}

impl From<ErrorShape> for ClientError {
    fn from(shape: ErrorShape) -> Self {
        Self::Application {
            code: shape.code,
            message: shape.message,
            details: shape.details,
        }
    }
}

/// Why the connection left `connected`, or why it never got there.
///
/// Published as part of the connection status; never returned from a call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    /// Socket could not be opened or was closed unexpectedly. Retried.
    #[error("transport: {0}")]
    Transport(String),
    /// hello-ok missing, late or malformed. Retried.
    #[error("handshake: {0}")]
    Handshake(String),
    /// Credential rejected. Fatal.
    #[error("authentication rejected ({}): {}", .0.code, .0.message)]
    Auth(HelloRejection),
    /// Protocol or feature mismatch. Fatal.
    #[error("incompatible gateway ({}): {}", .0.code, .0.message)]
    Incompatible(HelloRejection),
    #[error(transparent)]
    Protocol(#[from] ProtocolMismatch),
    /// The reconnection budget ran out. Fatal.
    #[error("gave up after {0} reconnection attempts")]
    ReconnectExhausted(u32),
}

impl Fault {
    /// Fatal faults put the client in `error` instead of `reconnecting`.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Transport(_) | Self::Handshake(_))
    }
}

impl From<HelloRejection> for Fault {
    fn from(rejection: HelloRejection) -> Self {
        if rejection.is_auth() {
            Self::Auth(rejection)
        } else {
            Self::Incompatible(rejection)
        }
    }
}
