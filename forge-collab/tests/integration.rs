//! End-to-end sync through a real relay.
//!
//! These tests start a relay on an ephemeral port and connect real
//! transports over WebSocket.

use std::sync::{Arc, Mutex};

use forge_collab::document::{DocumentStore, OriginTag, TextEdit};
use forge_collab::protocol::{room_doc_id, MessageType, PeerInfo, SyncMessage};
use forge_collab::relay::{RelayConfig, RelayServer};
use forge_collab::transport::{ConnectionState, RelayTransport, TransportConfig, TransportEvent, TransportHandle};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ROOM: &str = "monaco-demo";

async fn start_relay_with(config: RelayConfig) -> (RelayServer, String) {
    let listener = TcpListener::bind(&config.bind_addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let relay = RelayServer::new(config);
    let server = relay.clone();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (relay, format!("ws://{addr}"))
}

async fn start_relay() -> (RelayServer, String) {
    start_relay_with(RelayConfig {
        bind_addr: "127.0.0.1:0".into(),
        ..Default::default()
    })
    .await
}

fn fast_config() -> TransportConfig {
    TransportConfig {
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(200),
        heartbeat_interval: Duration::from_secs(1),
        ..Default::default()
    }
}

fn connect(url: &str, name: &str, config: TransportConfig) -> (Arc<DocumentStore>, TransportHandle) {
    let doc = Arc::new(DocumentStore::new(room_doc_id(ROOM)));
    let handle = RelayTransport::connect(config, url, ROOM, PeerInfo::new(name), doc.clone());
    (doc, handle)
}

async fn wait_connected(handle: &TransportHandle) {
    let mut state = handle.watch_state();
    timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .expect("connected within 5s")
        .unwrap();
}

async fn join(url: &str, name: &str) -> (Arc<DocumentStore>, TransportHandle) {
    let (doc, handle) = connect(url, name, fast_config());
    wait_connected(&handle).await;
    (doc, handle)
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn type_at(doc: &DocumentStore, offset: usize, text: &str) {
    doc.apply_local(TextEdit::insert(offset, text), OriginTag::anonymous())
        .unwrap();
}

/// A bare websocket that has joined the room as `info`.
async fn raw_join(url: &str, info: &PeerInfo) -> RawSocket {
    let (mut raw, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let hello = SyncMessage::peer_joined(room_doc_id(ROOM), info).unwrap();
    raw.send(Message::Binary(hello.encode().unwrap().into())).await.unwrap();
    // The relay answers a join with its SyncStep1.
    let reply = timeout(Duration::from_secs(2), raw.next()).await.unwrap().unwrap().unwrap();
    assert!(matches!(reply, Message::Binary(_)));
    raw
}

/// A real update inserting `text` into an empty document.
fn update_for(text: &str) -> Vec<u8> {
    let scratch = DocumentStore::new(room_doc_id(ROOM));
    scratch
        .apply_local(TextEdit::insert(0, text), OriginTag::anonymous())
        .unwrap()
        .update
}

#[tokio::test]
async fn test_relay_accepts_connections() {
    let (_relay, url) = start_relay().await;
    let result = tokio_tungstenite::connect_async(url.as_str()).await;
    assert!(result.is_ok(), "relay should accept a websocket");
}

#[tokio::test]
async fn test_edits_flow_both_ways() {
    let (relay, url) = start_relay().await;
    let (alice, _a) = join(&url, "Alice").await;
    let (bob, _b) = join(&url, "Bob").await;

    type_at(&alice, 0, "fn main() {}");
    eventually("bob sees alice", || bob.snapshot() == "fn main() {}").await;

    type_at(&bob, 11, " run(); ");
    eventually("alice sees bob", || alice.snapshot() == "fn main() { run(); }").await;

    assert_eq!(relay.room_text(&room_doc_id(ROOM)).await.as_deref(), Some("fn main() { run(); }"));
}

#[tokio::test]
async fn test_concurrent_inserts_at_same_offset_converge() {
    let (_relay, url) = start_relay().await;
    let (alice, _a) = join(&url, "Alice").await;
    let (bob, _b) = join(&url, "Bob").await;

    type_at(&alice, 0, "[]");
    eventually("base synced", || bob.snapshot() == "[]").await;

    type_at(&alice, 1, "alice");
    type_at(&bob, 1, "bob");

    eventually("convergence", || {
        let a = alice.snapshot();
        a == bob.snapshot() && a.len() == "[alicebob]".len()
    })
    .await;
    let text = alice.snapshot();
    assert!(text == "[alicebob]" || text == "[bobalice]", "got {text}");
}

#[tokio::test]
async fn test_late_joiner_gets_full_state() {
    let (_relay, url) = start_relay().await;
    let (alice, _a) = join(&url, "Alice").await;
    type_at(&alice, 0, "already here");
    eventually("acknowledged", || alice.pending_updates().is_empty()).await;

    let (carol, _c) = join(&url, "Carol").await;
    assert_eq!(carol.snapshot(), "already here");
}

#[tokio::test]
async fn test_relay_acknowledges_updates() {
    let (_relay, url) = start_relay().await;
    let (alice, _a) = join(&url, "Alice").await;
    for i in 0..5 {
        type_at(&alice, i, "x");
    }
    eventually("all acked", || alice.pending_updates().is_empty()).await;
}

#[tokio::test]
async fn test_offline_edits_replayed_on_connect() {
    // Reserve a port, then free it so the first attempts are refused.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);
    let url = format!("ws://{addr}");

    let (alice, alice_handle) = connect(&url, "Alice", fast_config());
    type_at(&alice, 0, "written offline");
    // Local edits are visible immediately, connection or not.
    assert_eq!(alice.snapshot(), "written offline");
    assert_ne!(alice_handle.state(), ConnectionState::Connected);

    let (_relay, url) = start_relay_with(RelayConfig {
        bind_addr: addr.to_string(),
        ..Default::default()
    })
    .await;
    wait_connected(&alice_handle).await;

    let (bob, _b) = join(&url, "Bob").await;
    eventually("bob sees offline edits", || bob.snapshot() == "written offline").await;
    eventually("alice acked", || alice.pending_updates().is_empty()).await;
}

#[tokio::test]
async fn test_dropped_connections_resync() {
    // The relay drops anyone silent for 300ms; clients only ping every 10s,
    // so both keep getting dropped and reconnecting.
    let (_relay, url) = start_relay_with(RelayConfig {
        bind_addr: "127.0.0.1:0".into(),
        heartbeat_timeout: Duration::from_millis(300),
        ..Default::default()
    })
    .await;
    let flaky = TransportConfig {
        heartbeat_interval: Duration::from_secs(10),
        ..fast_config()
    };

    let (alice, alice_handle) = connect(&url, "Alice", flaky.clone());
    let (bob, bob_handle) = connect(&url, "Bob", flaky);
    let drops = Arc::new(Mutex::new(0usize));
    let counter = drops.clone();
    alice_handle.on_event(move |event| {
        if matches!(event, TransportEvent::StateChanged(ConnectionState::Disconnected)) {
            *counter.lock().unwrap() += 1;
        }
    });
    wait_connected(&alice_handle).await;
    wait_connected(&bob_handle).await;

    type_at(&alice, 0, "one ");
    sleep(Duration::from_millis(400)).await;
    type_at(&bob, 0, "two ");
    sleep(Duration::from_millis(400)).await;
    type_at(&alice, 0, "three ");

    eventually("convergence across drops", || {
        let a = alice.snapshot();
        a == bob.snapshot() && a.len() == "one two three ".len()
    })
    .await;
    assert!(*drops.lock().unwrap() >= 1, "alice should have been dropped at least once");
}

#[tokio::test]
async fn test_malformed_delta_is_contained() {
    let (_relay, url) = start_relay().await;
    let (alice, _a) = join(&url, "Alice").await;

    let (mut raw, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let mallory = PeerInfo::new("Mallory");
    let doc_id = room_doc_id(ROOM);
    let frames = [
        SyncMessage::peer_joined(doc_id, &mallory).unwrap(),
        SyncMessage::delta(mallory.peer_id, doc_id, 1, vec![0xFF, 0x00, 0xAB]),
    ];
    for frame in frames {
        raw.send(Message::Binary(frame.encode().unwrap().into())).await.unwrap();
    }

    let (bob, _b) = join(&url, "Bob").await;
    type_at(&bob, 0, "still fine");
    eventually("alice unaffected", || alice.snapshot() == "still fine").await;
}

#[tokio::test]
async fn test_corrupted_string_delta_is_contained() {
    let (relay, url) = start_relay().await;
    let (alice, _a) = join(&url, "Alice").await;
    type_at(&alice, 0, "base");
    eventually("relay has base", || alice.pending_updates().is_empty()).await;

    let mallory = PeerInfo::new("Mallory");
    let mut raw = raw_join(&url, &mallory).await;
    let mut update = update_for("abcd");
    let at = update.windows(4).position(|w| w == b"abcd").unwrap();
    update[at + 1] = 0xFF;
    let delta = SyncMessage::delta(mallory.peer_id, room_doc_id(ROOM), 1, update);
    raw.send(Message::Binary(delta.encode().unwrap().into())).await.unwrap();

    let (bob, _b) = join(&url, "Bob").await;
    eventually("bob synced", || bob.snapshot() == "base").await;
    type_at(&bob, 4, " ok");
    eventually("alice sees bob", || alice.snapshot() == "base ok").await;
    assert_eq!(relay.room_text(&room_doc_id(ROOM)).await.as_deref(), Some("base ok"));
}

#[tokio::test]
async fn test_superseded_connection_keeps_room() {
    let (relay, url) = start_relay().await;
    let alice = PeerInfo::new("Alice");
    let doc_id = room_doc_id(ROOM);

    let mut old = raw_join(&url, &alice).await;
    let mut new = raw_join(&url, &alice).await;
    old.close(None).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(relay.room_count().await, 1, "the live connection keeps the room");

    let (bob, b) = join(&url, "Bob").await;
    let left = Arc::new(Mutex::new(false));
    let flag = left.clone();
    b.on_event(move |event| {
        if matches!(event, TransportEvent::PeerLeft(_)) {
            *flag.lock().unwrap() = true;
        }
    });

    let delta = SyncMessage::delta(alice.peer_id, doc_id, 1, update_for("from alice"));
    new.send(Message::Binary(delta.encode().unwrap().into())).await.unwrap();

    eventually("bob sees alice", || bob.snapshot() == "from alice").await;
    assert_eq!(relay.room_text(&doc_id).await.as_deref(), Some("from alice"));
    assert!(!*left.lock().unwrap(), "no departure announced for a live peer");
}

#[tokio::test]
async fn test_relay_answers_ping() {
    let (_relay, url) = start_relay().await;
    let (mut raw, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let ping = SyncMessage::ping(uuid::Uuid::new_v4());
    raw.send(Message::Binary(ping.encode().unwrap().into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), raw.next()).await.unwrap().unwrap().unwrap();
    let Message::Binary(data) = reply else {
        panic!("expected binary frame");
    };
    let pong = SyncMessage::decode(&data).unwrap();
    assert_eq!(pong.msg_type, MessageType::Pong);
    assert!(pong.from_relay());
}

#[tokio::test]
async fn test_empty_room_removed_after_disconnect() {
    let (relay, url) = start_relay().await;
    let (_alice, a) = join(&url, "Alice").await;
    let (_bob, b) = join(&url, "Bob").await;
    assert_eq!(relay.room_count().await, 1);

    a.disconnect().await;
    b.disconnect().await;
    b.disconnect().await;
    assert_eq!(a.state(), ConnectionState::Disconnected);

    for _ in 0..200 {
        if relay.room_count().await == 0 {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("room should be removed once empty");
}
