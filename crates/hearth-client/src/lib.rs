//! Resilient client for the Hearth gateway protocol.
//!
//! One [`GatewayClient`] per gateway. It connects over `ws://` or `wss://`,
//! performs the hello handshake, correlates requests with responses, fans out
//! server events to subscribers and reconnects with backoff when the socket
//! drops. Presence, state versions and leader election are kept current and
//! exposed through watch channels.
//!
//! ```no_run
//! # async fn demo() -> Result<(), hearth_client::ClientError> {
//! use hearth_client::GatewayClient;
//! use hearth_core::{ClientInfo, ConnectionState, StaticDeviceIdentity};
//!
//! let info = ClientInfo::new(&StaticDeviceIdentity("device-1".into()), "Desktop");
//! let client = GatewayClient::builder("ws://127.0.0.1:18789", info)?.build();
//! let chat = client.on("chat", |event| println!("{:?}", event.payload));
//! client.connect()?;
//! client.wait_for_state(ConnectionState::Connected).await?;
//! let sessions = client.request("sessions.list", serde_json::json!({})).await?;
//! # let _ = sessions;
//! chat.unsubscribe();
//! client.destroy().await;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod client;
mod config;
mod correlator;
mod credentials;
mod dispatcher;
mod error;
mod notify;
mod session;

pub use backoff::Backoff;
pub use client::{
    ClientBuilder, ConnectionStatus, GatewayClient, PresenceView, RequestOptions, SessionInfo,
};
pub use config::{BackoffConfig, ClientConfig, ConfigError};
pub use credentials::{CredentialStore, MemoryCredentialStore, NoCredentials, StoredCredential};
pub use dispatcher::Subscription;
pub use error::{ClientError, Fault};
pub use notify::{NoopNotifier, Notification, Notifier, Urgency};
