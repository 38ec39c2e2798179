//! The session task.
//!
//! A single task owns the socket, the pending request map, the subscription
//! registry and the presence/version trackers. The public handle only talks to
//! it through [`Command`]s, so every state transition happens in one place and
//! in submission order.

use crate::backoff::Backoff;
use crate::correlator::{Correlator, Reply};
use crate::dispatcher::{Dispatcher, Registration};
use crate::{
    ClientConfig, ClientError, ConnectionStatus, CredentialStore, Fault, Notification, Notifier,
    PresenceView, SessionInfo, StoredCredential, Urgency,
};
use futures_util::{SinkExt, StreamExt};
use hearth_core::{
    ClientFrame, ClientInfo, ConnectionState, Event, FollowerWatch, GatewayUrl, HelloAuth,
    HelloOk, PresenceTracker, PresenceUpdate, Role, ServerFrame, Snapshot, StateVersion,
    VersionAnomaly, VersionTracker,
};
use std::collections::BTreeSet;
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = Pin<Box<dyn Future<Output = Result<WsStream, tungstenite::Error>> + Send>>;

/// How long a graceful close may take before the socket is just dropped.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

pub(crate) enum Command {
    Connect,
    Disconnect {
        done: oneshot::Sender<()>,
    },
    Destroy {
        done: oneshot::Sender<()>,
    },
    Request {
        method: String,
        params: serde_json::Value,
        timeout: Option<Duration>,
        reply: Reply,
    },
    Subscribe(Registration),
    ApplySnapshot(Snapshot),
}

enum Phase {
    /// `disconnected` or `error`.
    Idle,
    Connecting(ConnectFuture),
    Handshaking { ws: WsStream, deadline: Instant },
    Connected { ws: WsStream },
    Backoff { until: Instant },
}

impl Phase {
    fn take_socket(self) -> Option<WsStream> {
        match self {
            Self::Handshaking { ws, .. } | Self::Connected { ws } => Some(ws),
            Self::Idle | Self::Connecting(_) | Self::Backoff { .. } => None,
        }
    }
}

enum Io {
    Opened(Result<WsStream, tungstenite::Error>),
    Frame(Option<Result<Message, tungstenite::Error>>),
    HandshakeTimeout,
    BackoffElapsed,
}

/// Wait for whatever the current phase is waiting on.
async fn next_io(phase: &mut Phase) -> Io {
    match phase {
        Phase::Idle => std::future::pending().await,
        Phase::Connecting(connect) => Io::Opened(connect.as_mut().await),
        Phase::Handshaking { ws, deadline } => {
            tokio::select! {
                frame = ws.next() => Io::Frame(frame),
                _ = sleep_until(*deadline) => Io::HandshakeTimeout,
            }
        }
        Phase::Connected { ws } => Io::Frame(ws.next().await),
        Phase::Backoff { until } => {
            sleep_until(*until).await;
            Io::BackoffElapsed
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn close_socket(mut ws: WsStream) {
    if tokio::time::timeout(CLOSE_GRACE, ws.close(None)).await.is_err() {
        tracing::debug!("close handshake timed out");
    }
}

fn heartbeat_interval(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

pub(crate) struct Session {
    url: GatewayUrl,
    info: Arc<ClientInfo>,
    config: ClientConfig,
    credentials: Arc<dyn CredentialStore>,
    notifier: Arc<dyn Notifier>,

    commands: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<ConnectionStatus>,
    presence_tx: watch::Sender<PresenceView>,
    session_tx: watch::Sender<Option<Arc<SessionInfo>>>,

    phase: Phase,
    correlator: Correlator,
    dispatcher: Dispatcher,
    backoff: Backoff,
    presence: PresenceTracker,
    versions: VersionTracker,
    stale: BTreeSet<String>,
    follower: FollowerWatch,
    heartbeat: Interval,
    last_seq: Option<u64>,
}

pub(crate) struct Channels {
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) status_tx: watch::Sender<ConnectionStatus>,
    pub(crate) presence_tx: watch::Sender<PresenceView>,
    pub(crate) session_tx: watch::Sender<Option<Arc<SessionInfo>>>,
}

impl Session {
    pub(crate) fn new(
        url: GatewayUrl,
        info: Arc<ClientInfo>,
        config: ClientConfig,
        credentials: Arc<dyn CredentialStore>,
        notifier: Arc<dyn Notifier>,
        channels: Channels,
    ) -> Self {
        let backoff = Backoff::new(config.backoff.clone());
        let versions = VersionTracker::new(config.version_gap_tolerance);
        let follower = FollowerWatch::new(info.instance_id.clone(), config.promotion_threshold);
        let heartbeat = heartbeat_interval(config.heartbeat_interval());
        Self {
            url,
            info,
            config,
            credentials,
            notifier,
            commands: channels.commands,
            status_tx: channels.status_tx,
            presence_tx: channels.presence_tx,
            session_tx: channels.session_tx,
            phase: Phase::Idle,
            correlator: Correlator::new(),
            dispatcher: Dispatcher::new(),
            backoff,
            presence: PresenceTracker::new(),
            versions,
            stale: BTreeSet::new(),
            follower,
            heartbeat,
            last_seq: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let request_deadline = self.correlator.next_deadline();
            let connected = matches!(self.phase, Phase::Connected { .. });

            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("all client handles dropped");
                        self.teardown().await;
                        self.dispatcher.clear();
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                io = next_io(&mut self.phase) => self.handle_io(io).await,
                _ = sleep_until_opt(request_deadline) => {
                    self.correlator.expire(Instant::now());
                }
                _ = self.heartbeat.tick(), if connected => self.heartbeat_cycle(),
            }
        }
        tracing::debug!("session for {} finished", self.url);
    }

    fn state(&self) -> ConnectionState {
        self.status_tx.borrow().state
    }

    fn set_status(&self, state: ConnectionState, last_fault: Option<Fault>) {
        let status = ConnectionStatus {
            state,
            last_fault,
            attempt: self.backoff.attempt(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            tracing::debug!("state {} -> {}", current.state, status.state);
            *current = status;
            true
        });
    }

    fn publish_presence(&self) {
        let view = PresenceView {
            entries: self.presence.entries().cloned().collect(),
            version: self.versions.current().clone(),
            stale: self.stale.clone(),
            leader: self.follower.leader().map(str::to_owned),
            role: self.follower.role(),
            missed_cycles: self.follower.missed_cycles(),
        };
        self.presence_tx.send_replace(view);
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect { done } => {
                self.teardown().await;
                let _ = done.send(());
            }
            Command::Destroy { done } => {
                self.teardown().await;
                tracing::info!(
                    "client for {} destroyed, dropping {} subscriptions",
                    self.url,
                    self.dispatcher.len()
                );
                self.dispatcher.clear();
                let _ = done.send(());
                return ControlFlow::Break(());
            }
            Command::Request {
                method,
                params,
                timeout,
                reply,
            } => self.send_request(method, params, timeout, reply).await,
            Command::Subscribe(registration) => self.dispatcher.add(registration),
            Command::ApplySnapshot(snapshot) => {
                self.adopt_snapshot(&snapshot);
                self.publish_presence();
            }
        }
        ControlFlow::Continue(())
    }

    fn connect(&mut self) {
        if !matches!(self.phase, Phase::Idle) {
            tracing::debug!("connect ignored in state {}", self.state());
            return;
        }
        self.backoff.reset();
        self.open(ConnectionState::Connecting, None);
    }

    fn open(&mut self, state: ConnectionState, last_fault: Option<Fault>) {
        tracing::info!("connecting to {}", self.url);
        let url = self.url.to_string();
        self.phase = Phase::Connecting(Box::pin(async move {
            connect_async(url).await.map(|(ws, _response)| ws)
        }));
        self.set_status(state, last_fault);
    }

    async fn send_request(
        &mut self,
        method: String,
        params: serde_json::Value,
        timeout: Option<Duration>,
        reply: Reply,
    ) {
        let Phase::Connected { ws } = &mut self.phase else {
            let _ = reply.send(Err(ClientError::NotConnected(self.state())));
            return;
        };

        let id = self.correlator.next_id();
        let frame = ClientFrame::Request {
            id: id.clone(),
            method: method.clone(),
            params,
        };
        let text = match frame.to_json() {
            Ok(text) => text,
            Err(e) => {
                let _ = reply.send(Err(ClientError::Encode(e.to_string())));
                return;
            }
        };

        tracing::debug!("-> {} #{} ({} in flight)", method, id, self.correlator.len());
        let timeout = timeout.unwrap_or_else(|| self.config.request_timeout());
        self.correlator.insert(id, method, timeout, reply);
        let sent = ws.send(Message::Text(text.into())).await;
        if let Err(e) = sent {
            self.transport_fault(Fault::Transport(e.to_string())).await;
        }
    }

    async fn handle_io(&mut self, io: Io) {
        match io {
            Io::Opened(Ok(ws)) => self.send_hello(ws).await,
            Io::Opened(Err(e)) => self.transport_fault(Fault::Transport(e.to_string())).await,
            Io::Frame(Some(Ok(message))) => self.handle_message(message).await,
            Io::Frame(Some(Err(e))) => self.transport_fault(Fault::Transport(e.to_string())).await,
            Io::Frame(None) => {
                self.transport_fault(Fault::Transport("connection closed".into()))
                    .await
            }
            Io::HandshakeTimeout => {
                let fault = Fault::Handshake(format!(
                    "no hello-ok within {:?}",
                    self.config.handshake_timeout()
                ));
                self.transport_fault(fault).await;
            }
            Io::BackoffElapsed => {
                let last_fault = self.status_tx.borrow().last_fault.clone();
                self.open(ConnectionState::Reconnecting, last_fault);
            }
        }
    }

    async fn send_hello(&mut self, mut ws: WsStream) {
        let auth = self
            .credentials
            .get_credential(&self.info.device_id, &self.url)
            .map(|stored| HelloAuth {
                token: stored.token,
            });
        let hello = ClientFrame::Hello {
            client: (*self.info).clone(),
            auth,
        };
        let text = match hello.to_json() {
            Ok(text) => text,
            Err(e) => {
                self.transport_fault(Fault::Handshake(e.to_string())).await;
                return;
            }
        };
        let sent = ws.send(Message::Text(text.into())).await;
        if let Err(e) = sent {
            self.transport_fault(Fault::Transport(e.to_string())).await;
            return;
        }
        tracing::debug!("hello sent to {}", self.url);
        self.phase = Phase::Handshaking {
            ws,
            deadline: Instant::now() + self.config.handshake_timeout(),
        };
    }

    async fn handle_message(&mut self, message: Message) {
        let text = match &message {
            Message::Text(text) => text.as_str(),
            Message::Binary(data) => match std::str::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    tracing::warn!("dropping non-UTF-8 binary frame ({} bytes)", data.len());
                    return;
                }
            },
            Message::Close(frame) => {
                let reason = frame
                    .as_ref()
                    .map(|f| format!("closed by gateway: {} {}", f.code, f.reason))
                    .unwrap_or_else(|| "closed by gateway".to_string());
                self.transport_fault(Fault::Transport(reason)).await;
                return;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return,
        };

        let handshaking = matches!(self.phase, Phase::Handshaking { .. });
        let frame = match ServerFrame::from_json(text) {
            Ok(frame) => frame,
            Err(e) if handshaking => {
                self.transport_fault(Fault::Handshake(format!("malformed frame: {e}")))
                    .await;
                return;
            }
            Err(e) => {
                tracing::warn!("dropping unparseable frame: {}", e);
                return;
            }
        };

        match frame {
            ServerFrame::HelloOk(ok) if handshaking => self.complete_handshake(ok).await,
            ServerFrame::HelloError { error } if handshaking => {
                tracing::error!("gateway rejected hello: {} {}", error.code, error.message);
                self.fatal(Fault::from(error)).await;
            }
            ServerFrame::Response(response) if !handshaking => {
                let id = response.id.clone();
                if !self.correlator.resolve(response) {
                    tracing::warn!("dropping response for unknown request #{}", id);
                }
            }
            ServerFrame::Event(event) if !handshaking => self.handle_event(event),
            other => tracing::warn!("unexpected {} frame in state {}", frame_kind(&other), self.state()),
        }
    }

    async fn complete_handshake(&mut self, ok: HelloOk) {
        if let Err(mismatch) = ok.check_protocol(&self.info.protocol) {
            self.fatal(Fault::Protocol(mismatch)).await;
            return;
        }
        let Phase::Handshaking { ws, .. } = std::mem::replace(&mut self.phase, Phase::Idle) else {
            return;
        };

        let stale_requests = self.correlator.reject_all();
        if stale_requests > 0 {
            tracing::debug!("rejected {} requests from the previous session", stale_requests);
        }

        if let Some(grant) = &ok.auth {
            let stored = StoredCredential::from_grant(&self.info.device_id, &self.url, grant);
            self.credentials.store_credential(stored, &self.url);
        }

        self.adopt_snapshot(&ok.snapshot);
        self.last_seq = None;

        let period = ok
            .policy
            .tick_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.heartbeat_interval())
            .max(Duration::from_millis(1));
        self.heartbeat = heartbeat_interval(period);

        tracing::info!(
            "connected to {} (server {}, protocol {}, {} peers)",
            self.url,
            ok.server.version,
            ok.protocol,
            self.presence.len()
        );

        self.session_tx.send_replace(Some(Arc::new(SessionInfo {
            protocol: ok.protocol,
            server: ok.server,
            features: ok.features,
            policy: ok.policy,
            snapshot: ok.snapshot,
        })));
        self.phase = Phase::Connected { ws };
        self.backoff.reset();
        self.publish_presence();
        self.set_status(ConnectionState::Connected, None);
    }

    fn adopt_snapshot(&mut self, snapshot: &Snapshot) {
        self.presence.replace(snapshot.presence.clone());
        self.versions.reset(snapshot.state_version.clone());
        self.stale.clear();
        self.follower.reset();
        self.follower.observe_presence(self.presence.ids());
    }

    fn handle_event(&mut self, event: Event) {
        if let Some(seq) = event.seq {
            if let Some(expected) = self.last_seq.map(|last| last.wrapping_add(1)) {
                if seq != expected {
                    tracing::warn!("event sequence gap: expected {}, got {}", expected, seq);
                }
            }
            self.last_seq = Some(seq);
        }

        let mut changed = false;
        let version_ok = match &event.state_version {
            Some(version) => {
                changed = true;
                self.apply_version(version)
            }
            None => true,
        };

        if event.name == self.config.presence_event {
            if version_ok {
                changed |= self.apply_presence(&event.payload);
            } else {
                tracing::debug!("presence update skipped until a fresh snapshot arrives");
            }
        }

        if event.name == self.config.heartbeat_event {
            if let Some(instance) = event.payload.get("instanceId").and_then(|v| v.as_str()) {
                self.follower.heartbeat(instance);
                changed = true;
            }
        }

        if changed {
            self.publish_presence();
        }
        self.dispatcher.dispatch(&event);
    }

    fn apply_version(&mut self, version: &StateVersion) -> bool {
        match self.versions.apply(version) {
            Ok(()) => true,
            Err(anomaly) => {
                tracing::warn!("{}; a fresh snapshot is required", anomaly);
                let (VersionAnomaly::Regression { domain, .. } | VersionAnomaly::Gap { domain, .. }) =
                    anomaly;
                self.stale.insert(domain);
                false
            }
        }
    }

    fn apply_presence(&mut self, payload: &serde_json::Value) -> bool {
        let update = match PresenceUpdate::from_payload(payload) {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!("dropping malformed presence update: {}", e);
                return false;
            }
        };
        let joined = match &update {
            PresenceUpdate::Join { entry } => Some(entry.instance_id.clone()),
            _ => None,
        };
        self.presence.apply(update);
        self.follower.observe_presence(self.presence.ids());
        if let Some(instance) = joined {
            self.follower.heartbeat(&instance);
        }
        true
    }

    fn heartbeat_cycle(&mut self) {
        let before = self.follower.role();
        let after = self.follower.cycle();
        if before != after {
            match after {
                Role::Promoted => tracing::info!(
                    "leader {} silent for {} cycles, taking over",
                    self.follower.leader().unwrap_or("?"),
                    self.follower.missed_cycles()
                ),
                role => tracing::info!("role changed to {:?}", role),
            }
        }
        self.publish_presence();
    }

    /// Drop the current socket or connection attempt and clear per-session state.
    async fn end_session(&mut self) {
        let previous = std::mem::replace(&mut self.phase, Phase::Idle);
        let rejected = self.correlator.reject_all();
        if rejected > 0 {
            tracing::debug!("rejected {} pending requests", rejected);
        }
        self.session_tx.send_replace(None);
        self.presence.clear();
        self.follower.reset();
        self.last_seq = None;
        self.publish_presence();
        if let Some(ws) = previous.take_socket() {
            close_socket(ws).await;
        }
    }

    /// Caller-initiated shutdown to `disconnected`.
    async fn teardown(&mut self) {
        self.end_session().await;
        self.backoff.reset();
        self.set_status(ConnectionState::Disconnected, None);
    }

    /// Recoverable failure: schedule a retry.
    async fn transport_fault(&mut self, fault: Fault) {
        self.end_session().await;

        if !self.config.auto_reconnect {
            tracing::warn!("connection to {} lost: {}", self.url, fault);
            self.set_status(ConnectionState::Disconnected, Some(fault));
            return;
        }

        let next = self.backoff.next_delay(&mut rand::thread_rng());
        let Some(delay) = next else {
            let attempts = self.backoff.attempt();
            tracing::warn!("connection to {} lost: {}", self.url, fault);
            self.fatal(Fault::ReconnectExhausted(attempts)).await;
            return;
        };
        tracing::warn!(
            "connection to {} lost: {}; retry {} in {:?}",
            self.url,
            fault,
            self.backoff.attempt(),
            delay
        );
        self.phase = Phase::Backoff {
            until: Instant::now() + delay,
        };
        self.set_status(ConnectionState::Reconnecting, Some(fault));
    }

    /// Unrecoverable failure: stop until the caller acts.
    async fn fatal(&mut self, fault: Fault) {
        self.end_session().await;
        if matches!(fault, Fault::Auth(_)) {
            self.credentials.clear_credential(&self.info.device_id, &self.url);
        }
        tracing::error!("connection to {} failed: {}", self.url, fault);
        self.notifier.notify(Notification {
            title: "Gateway connection failed".to_string(),
            body: fault.to_string(),
            urgency: Urgency::Critical,
        });
        self.set_status(ConnectionState::Error, Some(fault));
    }
}

fn frame_kind(frame: &ServerFrame) -> &'static str {
    match frame {
        ServerFrame::HelloOk(_) => "hello-ok",
        ServerFrame::HelloError { .. } => "hello-error",
        ServerFrame::Response(_) => "response",
        ServerFrame::Event(_) => "event",
    }
}
