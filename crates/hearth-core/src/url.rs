//! Gateway address.
//!
//! Only `ws://` and `wss://` targets are accepted; anything else is rejected
//! before a connection is attempted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// A validated WebSocket gateway URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GatewayUrl(Url);

impl GatewayUrl {
    /// `true` for `wss://`.
    pub fn is_secure(&self) -> bool {
        self.0.scheme() == "wss"
    }

    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }

    /// Host, explicit port and path, without the scheme or trailing slashes.
    pub fn normalized(&self) -> String {
        let host = self.0.host_str().unwrap_or_default();
        let path = self.0.path().trim_end_matches('/');
        match self.0.port() {
            Some(port) => format!("{host}:{port}{path}"),
            None => format!("{host}{path}"),
        }
    }

    /// Key under which a device credential for this gateway is stored.
    pub fn credential_key(&self, device_id: &str) -> String {
        format!("device-token:{}:{}", device_id, self.normalized())
    }
}

impl fmt::Display for GatewayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for GatewayUrl {
    type Err = GatewayUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let url = Url::parse(s).map_err(|e| match e {
            url::ParseError::RelativeUrlWithoutBase => GatewayUrlError::MissingScheme(s.to_string()),
            url::ParseError::EmptyHost => GatewayUrlError::MissingHost,
            source => GatewayUrlError::Invalid {
                url: s.to_string(),
                source,
            },
        })?;

        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(GatewayUrlError::UnsupportedScheme(other.to_string())),
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(GatewayUrlError::MissingHost);
        }
        Ok(Self(url))
    }
}

impl TryFrom<String> for GatewayUrl {
    type Error = GatewayUrlError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<GatewayUrl> for String {
    fn from(url: GatewayUrl) -> Self {
        url.0.into()
    }
}

/// Error parsing a gateway URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayUrlError {
    #[error("gateway url must contain a scheme, got: {0}")]
    MissingScheme(String),
    #[error("gateway url scheme must be ws or wss, got: {0}")]
    UnsupportedScheme(String),
    #[error("gateway url has no host")]
    MissingHost,
    #[error("invalid gateway url {url}: {source}")]
    Invalid {
        url: String,
        source: url::ParseError,
    },
}
