//! Public client handle.

use crate::dispatcher::{Handler, Registration, Subscription};
use crate::session::{Channels, Command, Session};
use crate::{
    ClientConfig, ClientError, CredentialStore, Fault, NoCredentials, NoopNotifier, Notifier,
};
use hearth_core::{
    ClientInfo, ConnectionState, Event, Features, GatewayUrl, Policy, PresenceEntry, Role,
    ServerInfo, Snapshot, StateVersion,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Observable connection status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Why the connection last left (or never reached) `connected`.
    pub last_fault: Option<Fault>,
    /// Consecutive failed reconnection attempts.
    pub attempt: u32,
}

/// What the server told us during the last successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
    pub policy: Policy,
    pub snapshot: Snapshot,
}

/// Presence, state versions and leadership as currently known.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceView {
    /// Sorted by instance id.
    pub entries: Vec<PresenceEntry>,
    pub version: StateVersion,
    /// Domains whose updates were refused; fetch a fresh snapshot and pass it
    /// to [`GatewayClient::apply_snapshot`].
    pub stale: BTreeSet<String>,
    pub leader: Option<String>,
    pub role: Role,
    pub missed_cycles: u32,
}

/// Per-call options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Overrides the configured request timeout.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

pub struct ClientBuilder {
    url: GatewayUrl,
    info: ClientInfo,
    config: ClientConfig,
    credentials: Arc<dyn CredentialStore>,
    notifier: Arc<dyn Notifier>,
}

impl ClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = store;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Spawn the session task. Must be called inside a Tokio runtime.
    pub fn build(self) -> GatewayClient {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionStatus::default());
        let (presence_tx, presence) = watch::channel(PresenceView::default());
        let (session_tx, session) = watch::channel(None);

        let info = Arc::new(self.info);
        let session_task = Session::new(
            self.url.clone(),
            info.clone(),
            self.config,
            self.credentials,
            self.notifier,
            Channels {
                commands,
                status_tx,
                presence_tx,
                session_tx,
            },
        );
        tokio::spawn(session_task.run());

        GatewayClient {
            url: self.url,
            info,
            commands: commands_tx,
            status,
            presence,
            session,
            next_subscription: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Handle to one gateway connection.
///
/// Cheap to clone; hand clones to whatever needs gateway access. The
/// connection lives until [`destroy`](Self::destroy) is called or every
/// clone is dropped.
#[derive(Clone)]
pub struct GatewayClient {
    url: GatewayUrl,
    info: Arc<ClientInfo>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    presence: watch::Receiver<PresenceView>,
    session: watch::Receiver<Option<Arc<SessionInfo>>>,
    next_subscription: Arc<AtomicU64>,
}

impl GatewayClient {
    /// Start configuring a client. Rejects anything but `ws://` / `wss://`.
    pub fn builder(url: &str, info: ClientInfo) -> Result<ClientBuilder, ClientError> {
        Ok(ClientBuilder {
            url: url.parse()?,
            info,
            config: ClientConfig::default(),
            credentials: Arc::new(NoCredentials),
            notifier: Arc::new(NoopNotifier),
        })
    }

    pub fn url(&self) -> &GatewayUrl {
        &self.url
    }

    pub fn client_info(&self) -> &ClientInfo {
        &self.info
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::Destroyed)
    }

    /// Begin connecting. Progress is observable through [`status`](Self::status).
    pub fn connect(&self) -> Result<(), ClientError> {
        self.send(Command::Connect)
    }

    /// Close the connection and reject every pending request.
    ///
    /// When this returns no request is pending and no retry is scheduled.
    pub async fn disconnect(&self) {
        let (done, wait) = oneshot::channel();
        if self.send(Command::Disconnect { done }).is_ok() {
            let _ = wait.await;
        }
    }

    /// Disconnect, drop every subscription and stop the session task.
    /// Idempotent.
    pub async fn destroy(&self) {
        let (done, wait) = oneshot::channel();
        if self.send(Command::Destroy { done }).is_ok() {
            let _ = wait.await;
        }
    }

    /// Call a method with the configured timeout.
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        self.request_with(method, params, RequestOptions::default())
            .await
    }

    pub async fn request_with(
        &self,
        method: &str,
        params: serde_json::Value,
        options: RequestOptions,
    ) -> Result<serde_json::Value, ClientError> {
        let (reply, outcome) = oneshot::channel();
        self.send(Command::Request {
            method: method.to_string(),
            params,
            timeout: options.timeout,
            reply,
        })?;
        outcome.await.map_err(|_| ClientError::ConnectionLost)?
    }

    /// Typed wrapper around [`request`](Self::request).
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, ClientError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params =
            serde_json::to_value(params).map_err(|e| ClientError::Encode(e.to_string()))?;
        let result = self.request(method, params).await?;
        serde_json::from_value(result).map_err(|e| ClientError::Decode(e.to_string()))
    }

    fn subscribe(&self, filter: Option<String>, handler: Handler) -> Subscription {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (registration, subscription) = Registration::new(id, filter, handler);
        if self.send(Command::Subscribe(registration)).is_err() {
            subscription.unsubscribe();
        }
        subscription
    }

    /// Run `handler` for every event named `name`.
    pub fn on<F>(&self, name: &str, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + 'static,
    {
        self.subscribe(Some(name.to_string()), Box::new(handler))
    }

    /// Run `handler` for every event.
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + 'static,
    {
        self.subscribe(None, Box::new(handler))
    }

    /// Replace presence and versions with a freshly fetched snapshot.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> Result<(), ClientError> {
        self.send(Command::ApplySnapshot(snapshot))
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn presence(&self) -> PresenceView {
        self.presence.borrow().clone()
    }

    pub fn watch_presence(&self) -> watch::Receiver<PresenceView> {
        self.presence.clone()
    }

    /// Negotiated session details; `None` while not connected.
    pub fn session_info(&self) -> Option<Arc<SessionInfo>> {
        self.session.borrow().clone()
    }

    pub fn watch_session(&self) -> watch::Receiver<Option<Arc<SessionInfo>>> {
        self.session.clone()
    }

    /// Wait until the connection reaches `state`.
    ///
    /// Returns early with the status if the connection lands in `error`
    /// while waiting for something else.
    pub async fn wait_for_state(
        &self,
        state: ConnectionState,
    ) -> Result<ConnectionStatus, ClientError> {
        let mut status = self.status.clone();
        let reached = status
            .wait_for(|s| s.state == state || s.state == ConnectionState::Error)
            .await
            .map_err(|_| ClientError::Destroyed)?;
        Ok(reached.clone())
    }
}
