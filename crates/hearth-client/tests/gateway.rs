//! End-to-end behaviour against an in-process fake gateway.

use futures_util::{SinkExt, StreamExt};
use hearth_client::{
    BackoffConfig, ClientConfig, ClientError, CredentialStore, Fault, GatewayClient,
    MemoryCredentialStore, Notification, Notifier, RequestOptions, StoredCredential, Urgency,
};
use hearth_core::{
    ClientInfo, ConnectionState, GatewayUrl, PROTOCOL_VERSION, Role, StaticDeviceIdentity,
};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

struct FakeGateway {
    listener: TcpListener,
    url: String,
}

impl FakeGateway {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        Self { listener, url }
    }

    async fn accept(&self) -> Peer {
        let (stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        Peer { ws }
    }

    /// `true` if a client connects within `window`.
    async fn connects_within(&self, window: Duration) -> bool {
        timeout(window, self.listener.accept()).await.is_ok()
    }
}

struct Peer {
    ws: WebSocketStream<TcpStream>,
}

impl Peer {
    async fn recv(&mut self) -> Value {
        loop {
            let message = timeout(WAIT, self.ws.next())
                .await
                .expect("no frame from client")
                .expect("client closed the socket")
                .unwrap();
            match message {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Close(_) => panic!("client closed the socket"),
                _ => continue,
            }
        }
    }

    async fn send(&mut self, frame: Value) {
        self.ws
            .send(Message::Text(frame.to_string().into()))
            .await
            .unwrap();
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .unwrap();
    }

    /// Receive hello and answer with hello-ok. Returns the hello frame.
    async fn handshake(&mut self, hello_ok: Value) -> Value {
        let hello = self.recv().await;
        assert_eq!(hello["type"], "hello");
        self.send(hello_ok).await;
        hello
    }

    async fn respond(&mut self, id: &Value, result: Value) {
        self.send(json!({"type": "response", "id": id, "result": result}))
            .await;
    }

    async fn event(&mut self, event: Value) {
        let mut frame = event;
        frame["type"] = json!("event");
        self.send(frame).await;
    }
}

fn hello_ok(presence: &[&str], tick_ms: u64) -> Value {
    let presence: Vec<Value> = presence.iter().map(|id| json!({"instanceId": id})).collect();
    json!({
        "type": "hello-ok",
        "protocol": PROTOCOL_VERSION,
        "server": {"version": "test-1", "connId": "conn-1"},
        "features": {"methods": ["echo"], "events": ["chat", "presence"]},
        "policy": {"tickIntervalMs": tick_ms},
        "snapshot": {
            "presence": presence,
            "stateVersion": {"presence": 1, "health": 1},
            "sessionDefaults": {"agent": "main"}
        },
        "auth": {"deviceToken": "issued-token", "role": "operator", "scopes": ["operator.read"], "issuedAtMs": 1}
    })
}

fn fast_config() -> ClientConfig {
    ClientConfig {
        request_timeout_ms: 2_000,
        handshake_timeout_ms: 300,
        backoff: BackoffConfig {
            initial_ms: 20,
            factor: 2.0,
            max_ms: 100,
            jitter: 0.0,
            max_attempts: None,
        },
        ..ClientConfig::default()
    }
}

fn info(instance: &str) -> ClientInfo {
    ClientInfo::new(&StaticDeviceIdentity("device-1".into()), "Test").with_instance_id(instance)
}

fn client(gateway: &FakeGateway, config: ClientConfig) -> GatewayClient {
    GatewayClient::builder(&gateway.url, info("self"))
        .unwrap()
        .config(config)
        .build()
}

async fn connected(gateway: &FakeGateway, client: &GatewayClient, presence: &[&str]) -> Peer {
    client.connect().unwrap();
    let mut peer = gateway.accept().await;
    peer.handshake(hello_ok(presence, 60_000)).await;
    let status = timeout(WAIT, client.wait_for_state(ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state, ConnectionState::Connected);
    peer
}

#[derive(Default)]
struct RecordingNotifier(Mutex<Vec<Notification>>);

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.0.lock().unwrap().push(notification);
    }
}

#[tokio::test]
async fn handshake_populates_session_and_stores_grant() {
    let gateway = FakeGateway::start().await;
    let store = Arc::new(MemoryCredentialStore::new());
    let client = GatewayClient::builder(&gateway.url, info("self"))
        .unwrap()
        .config(fast_config())
        .credentials(store.clone())
        .build();

    client.connect().unwrap();
    let mut peer = gateway.accept().await;
    let hello = peer.handshake(hello_ok(&["self", "other"], 60_000)).await;
    assert_eq!(hello["client"]["instanceId"], "self");
    assert_eq!(hello["client"]["deviceId"], "device-1");
    assert!(hello.get("auth").is_none());

    timeout(WAIT, client.wait_for_state(ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();

    let session = client.session_info().expect("session info after hello-ok");
    assert_eq!(session.server.version, "test-1");
    assert!(session.features.has_method("echo"));
    assert_eq!(session.snapshot.rest["sessionDefaults"]["agent"], "main");

    let url: GatewayUrl = gateway.url.parse().unwrap();
    let stored = store.get_credential("device-1", &url).unwrap();
    assert_eq!(stored.token, "issued-token");

    let presence = client.presence();
    assert_eq!(presence.entries.len(), 2);
    assert_eq!(presence.leader.as_deref(), Some("other"));
    assert_eq!(presence.role, Role::Follower);
}

#[tokio::test]
async fn stored_credential_is_sent_in_hello() {
    let gateway = FakeGateway::start().await;
    let url: GatewayUrl = gateway.url.parse().unwrap();
    let store = Arc::new(MemoryCredentialStore::new());
    store.store_credential(
        StoredCredential {
            token: "saved".into(),
            device_id: "device-1".into(),
            gateway_url: url.to_string(),
            role: "operator".into(),
            scopes: vec![],
            issued_at_ms: 0,
            stored_at_ms: 0,
        },
        &url,
    );
    let client = GatewayClient::builder(&gateway.url, info("self"))
        .unwrap()
        .credentials(store)
        .build();

    client.connect().unwrap();
    let mut peer = gateway.accept().await;
    let hello = peer.recv().await;
    assert_eq!(hello["auth"]["token"], "saved");
}

#[tokio::test]
async fn responses_are_matched_by_id() {
    let gateway = FakeGateway::start().await;
    let client = client(&gateway, fast_config());
    let mut peer = connected(&gateway, &client, &[]).await;

    let first = client.request("first", json!({"n": 1}));
    let second = client.request("second", json!({"n": 2}));
    let server = async {
        let a = peer.recv().await;
        let b = peer.recv().await;
        assert_eq!(a["method"], "first");
        assert_eq!(b["method"], "second");
        assert_ne!(a["id"], b["id"]);
        peer.respond(&b["id"], json!("two")).await;
        peer.respond(&a["id"], json!("one")).await;
    };

    let (first, second, ()) = tokio::join!(first, second, server);
    assert_eq!(first.unwrap(), json!("one"));
    assert_eq!(second.unwrap(), json!("two"));
}

#[tokio::test]
async fn application_error_rejects_only_that_request() {
    let gateway = FakeGateway::start().await;
    let client = client(&gateway, fast_config());
    let mut peer = connected(&gateway, &client, &[]).await;

    let call = client.request("sessions.get", json!({"key": "missing"}));
    let server = async {
        let req = peer.recv().await;
        peer.send(json!({
            "type": "response",
            "id": req["id"],
            "error": {"code": "not_found", "message": "no such session"}
        }))
        .await;
    };
    let (result, ()) = tokio::join!(call, server);
    assert_eq!(
        result.unwrap_err(),
        ClientError::Application {
            code: "not_found".into(),
            message: "no such session".into(),
            details: None,
        }
    );
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn typed_call_round_trips() {
    #[derive(serde::Serialize)]
    struct Params {
        text: &'static str,
    }
    #[derive(serde::Deserialize, Debug, PartialEq)]
    struct Echo {
        text: String,
    }

    let gateway = FakeGateway::start().await;
    let client = client(&gateway, fast_config());
    let mut peer = connected(&gateway, &client, &[]).await;

    let call = client.call::<_, Echo>("echo", &Params { text: "hi" });
    let server = async {
        let req = peer.recv().await;
        peer.respond(&req["id"], req["params"].clone()).await;
    };
    let (echo, ()) = tokio::join!(call, server);
    assert_eq!(echo.unwrap(), Echo { text: "hi".into() });
}

#[tokio::test]
async fn timeout_wins_over_late_response() {
    let gateway = FakeGateway::start().await;
    let client = client(&gateway, fast_config());
    let mut peer = connected(&gateway, &client, &[]).await;

    let slow = client.request_with(
        "slow",
        json!({}),
        RequestOptions::timeout(Duration::from_millis(100)),
    );
    let server = async {
        let req = peer.recv().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        peer.respond(&req["id"], json!("too late")).await;
    };
    let (result, ()) = tokio::join!(slow, server);
    assert!(matches!(
        result,
        Err(ClientError::Timeout { ref method, .. }) if method == "slow"
    ));

    // Connection survives and keeps correlating.
    let next = client.request("next", json!({}));
    let server = async {
        let req = peer.recv().await;
        assert_eq!(req["method"], "next");
        peer.respond(&req["id"], json!(true)).await;
    };
    let (result, ()) = tokio::join!(next, server);
    assert_eq!(result.unwrap(), json!(true));
}

#[tokio::test]
async fn requests_fail_fast_when_not_connected() {
    let gateway = FakeGateway::start().await;
    let client = client(&gateway, fast_config());
    let err = client.request("status", json!({})).await.unwrap_err();
    assert_eq!(err, ClientError::NotConnected(ConnectionState::Disconnected));
}

#[tokio::test]
async fn disconnect_rejects_every_pending_request() {
    let gateway = FakeGateway::start().await;
    let client = client(&gateway, fast_config());
    let mut peer = connected(&gateway, &client, &["self"]).await;

    let calls: Vec<_> = (0..3)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.request(&format!("m{i}"), json!({})).await })
        })
        .collect();
    for _ in 0..3 {
        peer.recv().await;
    }

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.session_info().is_none());
    assert!(client.presence().entries.is_empty());

    for call in calls {
        assert_eq!(call.await.unwrap(), Err(ClientError::ConnectionLost));
    }
    assert!(!gateway.connects_within(Duration::from_millis(200)).await);
}

#[tokio::test]
async fn hello_error_is_fatal_and_clears_credential() {
    let gateway = FakeGateway::start().await;
    let url: GatewayUrl = gateway.url.parse().unwrap();
    let store = Arc::new(MemoryCredentialStore::new());
    store.store_credential(
        StoredCredential {
            token: "revoked".into(),
            device_id: "device-1".into(),
            gateway_url: url.to_string(),
            role: String::new(),
            scopes: vec![],
            issued_at_ms: 0,
            stored_at_ms: 0,
        },
        &url,
    );
    let notifier = Arc::new(RecordingNotifier::default());
    let client = GatewayClient::builder(&gateway.url, info("self"))
        .unwrap()
        .config(fast_config())
        .credentials(store.clone())
        .notifier(notifier.clone())
        .build();

    client.connect().unwrap();
    let mut peer = gateway.accept().await;
    peer.recv().await;
    peer.send(json!({
        "type": "hello-error",
        "error": {"code": "unauthorized", "message": "device token revoked"}
    }))
    .await;

    let status = timeout(WAIT, client.wait_for_state(ConnectionState::Error))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state, ConnectionState::Error);
    assert!(matches!(status.last_fault, Some(Fault::Auth(ref r)) if r.code == "unauthorized"));
    assert!(store.get_credential("device-1", &url).is_none());

    let notes = notifier.0.lock().unwrap().clone();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].urgency, Urgency::Critical);

    assert!(!gateway.connects_within(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn incompatible_protocol_is_fatal() {
    let gateway = FakeGateway::start().await;
    let client = client(&gateway, fast_config());
    client.connect().unwrap();
    let mut peer = gateway.accept().await;
    let mut reply = hello_ok(&[], 60_000);
    reply["protocol"] = json!(PROTOCOL_VERSION + 1);
    peer.handshake(reply).await;

    let status = timeout(WAIT, client.wait_for_state(ConnectionState::Error))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(status.last_fault, Some(Fault::Protocol(_))));
}

#[tokio::test]
async fn socket_loss_reconnects_and_resets_attempts() {
    let gateway = FakeGateway::start().await;
    let client = client(&gateway, fast_config());
    let mut peer = connected(&gateway, &client, &[]).await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request("hangs", json!({})).await })
    };
    peer.recv().await;
    let mut status = client.watch_status();
    drop(peer);

    assert_eq!(pending.await.unwrap(), Err(ClientError::ConnectionLost));
    let reconnecting = timeout(
        WAIT,
        status.wait_for(|s| s.state == ConnectionState::Reconnecting),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(reconnecting.attempt, 1);
    assert!(matches!(reconnecting.last_fault, Some(Fault::Transport(_))));

    let mut peer = gateway.accept().await;
    peer.handshake(hello_ok(&[], 60_000)).await;
    let status = timeout(WAIT, client.wait_for_state(ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.attempt, 0);
    assert_eq!(status.last_fault, None);
}

#[tokio::test]
async fn disconnect_during_backoff_cancels_the_retry() {
    let gateway = FakeGateway::start().await;
    let mut config = fast_config();
    config.backoff.initial_ms = 300;
    config.backoff.max_ms = 300;
    let client = client(&gateway, config);
    let peer = connected(&gateway, &client, &[]).await;

    let mut status = client.watch_status();
    drop(peer);
    timeout(
        WAIT,
        status.wait_for(|s| s.state == ConnectionState::Reconnecting),
    )
    .await
    .unwrap()
    .unwrap();

    client.disconnect().await;
    let status = client.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.last_fault, None);
    assert_eq!(status.attempt, 0);

    assert!(!gateway.connects_within(Duration::from_millis(700)).await);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn silent_handshake_is_retried() {
    let gateway = FakeGateway::start().await;
    let client = client(&gateway, fast_config());
    client.connect().unwrap();

    let mut first = gateway.accept().await;
    first.recv().await;
    // No hello-ok: the client gives up on this socket and dials again.
    let mut second = gateway.accept().await;
    assert!(matches!(
        client.status().last_fault,
        Some(Fault::Handshake(_))
    ));
    second.handshake(hello_ok(&[], 60_000)).await;
    timeout(WAIT, client.wait_for_state(ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn reconnect_budget_runs_out() {
    let gateway = FakeGateway::start().await;
    let url = gateway.url.clone();
    drop(gateway);

    let mut config = fast_config();
    config.backoff.max_attempts = Some(2);
    let client = GatewayClient::builder(&url, info("self"))
        .unwrap()
        .config(config)
        .build();
    client.connect().unwrap();

    let status = timeout(WAIT, client.wait_for_state(ConnectionState::Error))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.last_fault, Some(Fault::ReconnectExhausted(2)));
}

#[tokio::test]
async fn events_reach_subscribers_in_order() {
    let gateway = FakeGateway::start().await;
    let client = client(&gateway, fast_config());
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let chat_tx = tx.clone();
    let chat = client.on("chat", move |event| {
        let _ = chat_tx.send(format!("chat:{}", event.payload["text"].as_str().unwrap_or("")));
    });
    let any_tx = tx.clone();
    let _any = client.on_any(move |event| {
        let _ = any_tx.send(format!("any:{}", event.name));
    });
    let _boom = client.on("chat", |_| panic!("handler failure"));

    let mut peer = connected(&gateway, &client, &[]).await;
    peer.event(json!({"name": "chat", "payload": {"text": "hello"}})).await;
    peer.event(json!({"name": "cron", "payload": {}})).await;

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(timeout(WAIT, rx.recv()).await.unwrap().unwrap());
    }
    assert_eq!(seen, ["chat:hello", "any:chat", "any:cron"]);

    chat.unsubscribe();
    chat.unsubscribe();
    peer.event(json!({"name": "chat", "payload": {"text": "again"}})).await;
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), "any:chat");
}

#[tokio::test]
async fn sequence_wraparound_keeps_the_session_alive() {
    let gateway = FakeGateway::start().await;
    let client = client(&gateway, fast_config());
    let (tx, mut rx) = mpsc::unbounded_channel::<Option<u64>>();
    let _seqs = client.on("tick", move |event| {
        let _ = tx.send(event.seq);
    });
    let mut peer = connected(&gateway, &client, &[]).await;

    peer.event(json!({"name": "tick", "payload": {}, "seq": u64::MAX}))
        .await;
    peer.event(json!({"name": "tick", "payload": {}, "seq": 0})).await;
    peer.event(json!({"name": "tick", "payload": {}, "seq": 5})).await;

    for expected in [u64::MAX, 0, 5] {
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap().unwrap(), Some(expected));
    }

    let call = client.request("still.up", json!({}));
    let server = async {
        let req = peer.recv().await;
        peer.respond(&req["id"], json!(1)).await;
    };
    let (result, ()) = tokio::join!(call, server);
    assert_eq!(result.unwrap(), json!(1));
}

#[tokio::test]
async fn garbage_and_unknown_responses_are_dropped() {
    let gateway = FakeGateway::start().await;
    let client = client(&gateway, fast_config());
    let mut peer = connected(&gateway, &client, &[]).await;

    peer.send_raw("not json").await;
    peer.send_raw(r#"{"type":"mystery"}"#).await;
    peer.respond(&json!("no-such-id"), json!(1)).await;

    let call = client.request("still.works", json!({}));
    let server = async {
        let req = peer.recv().await;
        peer.respond(&req["id"], json!("yes")).await;
    };
    let (result, ()) = tokio::join!(call, server);
    assert_eq!(result.unwrap(), json!("yes"));
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn presence_deltas_and_version_checks() {
    let gateway = FakeGateway::start().await;
    let client = client(&gateway, fast_config());
    let mut peer = connected(&gateway, &client, &["b", "self"]).await;
    let mut presence = client.watch_presence();

    peer.event(json!({
        "name": "presence",
        "payload": {"kind": "join", "entry": {"instanceId": "a", "platform": "ios"}},
        "stateVersion": {"presence": 2}
    }))
    .await;
    let view = timeout(WAIT, presence.wait_for(|v| v.entries.len() == 3))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(view.leader.as_deref(), Some("a"));
    assert_eq!(view.version.presence(), Some(2));
    assert_eq!(view.version.health(), Some(1));
    assert!(view.stale.is_empty());

    // Stale counter: refused, and flagged for resync.
    peer.event(json!({
        "name": "presence",
        "payload": {"kind": "leave", "instanceId": "a"},
        "stateVersion": {"presence": 1}
    }))
    .await;
    let view = timeout(WAIT, presence.wait_for(|v| !v.stale.is_empty()))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert!(view.stale.contains("presence"));
    assert_eq!(view.entries.len(), 3);
    assert_eq!(view.version.presence(), Some(2));

    // A fresh snapshot clears the flag.
    let snapshot = serde_json::from_value(json!({
        "presence": [{"instanceId": "self"}],
        "stateVersion": {"presence": 9, "health": 4}
    }))
    .unwrap();
    client.apply_snapshot(snapshot).unwrap();
    let view = timeout(WAIT, presence.wait_for(|v| v.stale.is_empty()))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(view.entries.len(), 1);
    assert_eq!(view.role, Role::Leader);
    assert_eq!(view.version.presence(), Some(9));
}

#[tokio::test]
async fn follower_promotes_when_leader_goes_quiet() {
    let gateway = FakeGateway::start().await;
    let client = client(&gateway, fast_config());
    client.connect().unwrap();
    let mut peer = gateway.accept().await;
    peer.handshake(hello_ok(&["a", "self"], 100)).await;
    timeout(WAIT, client.wait_for_state(ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();

    let mut presence = client.watch_presence();
    assert_eq!(presence.borrow().role, Role::Follower);

    let view = timeout(WAIT, presence.wait_for(|v| v.role == Role::Promoted))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert!(view.missed_cycles >= 3);
    assert_eq!(view.leader.as_deref(), Some("a"));

    peer.event(json!({"name": "heartbeat", "payload": {"instanceId": "a"}}))
        .await;
    timeout(WAIT, presence.wait_for(|v| v.role == Role::Follower))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn destroy_is_idempotent_and_final() {
    let gateway = FakeGateway::start().await;
    let client = client(&gateway, fast_config());
    let _peer = connected(&gateway, &client, &[]).await;
    let sub = client.on_any(|_| {});

    client.destroy().await;
    client.destroy().await;
    assert!(!sub.is_active());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.connect(), Err(ClientError::Destroyed));
    assert_eq!(
        client.request("x", json!({})).await,
        Err(ClientError::Destroyed)
    );
    assert!(!client.on("chat", |_| {}).is_active());
}

#[tokio::test]
async fn rejects_non_websocket_urls() {
    let result = GatewayClient::builder("https://gateway.example.com", info("self"));
    assert!(matches!(result, Err(ClientError::InvalidUrl(_))));
}
