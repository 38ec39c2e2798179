//! Device credential persistence seam.
//!
//! The client never stores secrets itself. It asks the injected
//! [`CredentialStore`] for a token before hello, hands it the grant from
//! hello-ok, and tells it to forget the token when the gateway rejects it.

use hearth_core::{AuthGrant, GatewayUrl};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// A persisted device token with the metadata it was issued with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredential {
    pub token: String,
    pub device_id: String,
    pub gateway_url: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub issued_at_ms: i64,
    pub stored_at_ms: i64,
}

impl StoredCredential {
    pub fn from_grant(device_id: &str, url: &GatewayUrl, grant: &AuthGrant) -> Self {
        let stored_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self {
            token: grant.device_token.clone(),
            device_id: device_id.to_string(),
            gateway_url: url.to_string(),
            role: grant.role.clone(),
            scopes: grant.scopes.clone(),
            issued_at_ms: grant.issued_at_ms,
            stored_at_ms,
        }
    }
}

/// Storage for device credentials, keyed by device id and gateway.
///
/// Implementations are expected to be quick (keychain calls, a file read);
/// they run on the session task.
pub trait CredentialStore: Send + Sync {
    fn get_credential(&self, device_id: &str, url: &GatewayUrl) -> Option<StoredCredential>;
    fn store_credential(&self, credential: StoredCredential, url: &GatewayUrl);
    fn clear_credential(&self, device_id: &str, url: &GatewayUrl);
}

/// Store that never has anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

impl CredentialStore for NoCredentials {
    fn get_credential(&self, _device_id: &str, _url: &GatewayUrl) -> Option<StoredCredential> {
        None
    }

    fn store_credential(&self, _credential: StoredCredential, _url: &GatewayUrl) {}

    fn clear_credential(&self, _device_id: &str, _url: &GatewayUrl) {}
}

/// Process-local store, mostly for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    tokens: Mutex<HashMap<String, StoredCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().map(|t| t.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get_credential(&self, device_id: &str, url: &GatewayUrl) -> Option<StoredCredential> {
        let tokens = self.tokens.lock().ok()?;
        tokens.get(&url.credential_key(device_id)).cloned()
    }

    fn store_credential(&self, credential: StoredCredential, url: &GatewayUrl) {
        let key = url.credential_key(&credential.device_id);
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(key, credential);
        }
    }

    fn clear_credential(&self, device_id: &str, url: &GatewayUrl) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(&url.credential_key(device_id));
        }
    }
}
