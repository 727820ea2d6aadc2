//! Presence over the network: join announcements, cursors, selections
//! and departures as seen by the other participants.

use std::sync::{Arc, Mutex};

use forge_collab::document::DocumentStore;
use forge_collab::presence::{AwarenessMessage, CursorPosition, SelectionRange};
use forge_collab::protocol::{room_doc_id, PeerInfo, SyncMessage};
use forge_collab::relay::{RelayConfig, RelayServer};
use forge_collab::transport::{ConnectionState, RelayTransport, TransportConfig, TransportEvent, TransportHandle};
use futures_util::SinkExt;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

const ROOM: &str = "presence-room";

async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let relay = RelayServer::new(RelayConfig {
        bind_addr: addr.to_string(),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
        ..Default::default()
    });
    tokio::spawn(async move {
        let _ = relay.serve(listener).await;
    });
    format!("ws://{addr}")
}

async fn join(url: &str, name: &str) -> TransportHandle {
    let doc = Arc::new(DocumentStore::new(room_doc_id(ROOM)));
    let config = TransportConfig {
        initial_backoff: Duration::from_millis(20),
        heartbeat_interval: Duration::from_secs(1),
        ..Default::default()
    };
    let handle = RelayTransport::connect(config, url, ROOM, PeerInfo::new(name), doc);
    let mut state = handle.watch_state();
    timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .expect("connected within 5s")
        .unwrap();
    handle
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

#[tokio::test]
async fn test_participants_see_each_other() {
    let url = start_relay().await;
    let alice = join(&url, "Alice").await;
    let bob = join(&url, "Bob").await;

    eventually("bob sees alice", || bob.peers().iter().any(|p| p.user_name == "Alice")).await;
    eventually("alice sees bob", || alice.peers().iter().any(|p| p.user_name == "Bob")).await;

    // Nobody lists themselves.
    assert!(alice.peers().iter().all(|p| p.user_id != alice.peer_id()));
}

#[tokio::test]
async fn test_cursor_reaches_peer() {
    let url = start_relay().await;
    let alice = join(&url, "Alice").await;
    let bob = join(&url, "Bob").await;
    let alice_id = alice.peer_id();
    eventually("bob sees alice", || bob.peers().iter().any(|p| p.user_id == alice_id)).await;

    alice.update_cursor(CursorPosition::new(12, 4)).unwrap();

    eventually("cursor arrives", || {
        bob.peers()
            .iter()
            .any(|p| p.user_id == alice_id && p.cursor == Some(CursorPosition::new(12, 4)))
    })
    .await;
}

#[tokio::test]
async fn test_selection_set_and_cleared() {
    let url = start_relay().await;
    let alice = join(&url, "Alice").await;
    let bob = join(&url, "Bob").await;
    let alice_id = alice.peer_id();
    eventually("bob sees alice", || bob.peers().iter().any(|p| p.user_id == alice_id)).await;

    let range = SelectionRange {
        anchor: CursorPosition::new(1, 0),
        head: CursorPosition::new(3, 8),
    };
    alice.update_selection(Some(range)).unwrap();
    eventually("selection arrives", || {
        bob.peers().iter().any(|p| p.user_id == alice_id && p.selection == Some(range))
    })
    .await;

    alice.update_selection(None).unwrap();
    eventually("selection cleared", || {
        bob.peers().iter().any(|p| p.user_id == alice_id && p.selection.is_none())
    })
    .await;
}

#[tokio::test]
async fn test_departure_removes_presence() {
    let url = start_relay().await;
    let alice = join(&url, "Alice").await;
    let bob = join(&url, "Bob").await;
    let alice_id = alice.peer_id();

    let left = Arc::new(Mutex::new(Vec::new()));
    let seen = left.clone();
    bob.on_event(move |event| {
        if let TransportEvent::PeerLeft(id) = event {
            seen.lock().unwrap().push(*id);
        }
    });
    eventually("bob sees alice", || bob.peers().iter().any(|p| p.user_id == alice_id)).await;

    alice.disconnect().await;

    eventually("alice gone", || bob.peers().is_empty()).await;
    eventually("peer left event", || left.lock().unwrap().contains(&alice_id)).await;
}

#[tokio::test]
async fn test_presence_listener_fires() {
    let url = start_relay().await;
    let bob = join(&url, "Bob").await;
    let joins = Arc::new(Mutex::new(Vec::new()));
    let seen = joins.clone();
    bob.on_peer_presence(move |msg| {
        if let AwarenessMessage::Join { user_name, .. } = msg {
            seen.lock().unwrap().push(user_name.clone());
        }
    });

    let _carol = join(&url, "Carol").await;
    eventually("join reported", || joins.lock().unwrap().iter().any(|n| n == "Carol")).await;
}

#[tokio::test]
async fn test_spoofed_cursor_is_ignored() {
    let url = start_relay().await;
    let alice = join(&url, "Alice").await;
    let bob = join(&url, "Bob").await;
    let alice_id = alice.peer_id();

    alice.update_cursor(CursorPosition::new(2, 2)).unwrap();
    eventually("real cursor", || {
        bob.peers()
            .iter()
            .any(|p| p.user_id == alice_id && p.cursor == Some(CursorPosition::new(2, 2)))
    })
    .await;

    let joined = Arc::new(Mutex::new(Vec::new()));
    let seen = joined.clone();
    bob.on_event(move |event| {
        if let TransportEvent::PeerJoined(info) = event {
            seen.lock().unwrap().push(info.peer_id);
        }
    });

    let (mut raw, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let mallory = PeerInfo::new("Mallory");
    let doc_id = room_doc_id(ROOM);
    let forged = AwarenessMessage::Cursor {
        user_id: alice_id,
        position: CursorPosition::new(99, 99),
        timestamp: u64::MAX,
    };
    let frames = [
        SyncMessage::peer_joined(doc_id, &mallory).unwrap(),
        // Mallory's own frame, speaking for Alice.
        SyncMessage::awareness(mallory.peer_id, doc_id, &forged).unwrap(),
        // A frame claiming to come from Alice on Mallory's connection.
        SyncMessage::awareness(alice_id, doc_id, &forged).unwrap(),
    ];
    for frame in frames {
        raw.send(Message::Binary(frame.encode().unwrap().into())).await.unwrap();
    }

    eventually("mallory joined", || joined.lock().unwrap().contains(&mallory.peer_id)).await;
    sleep(Duration::from_millis(200)).await;
    let alice_seen = bob.peers().into_iter().find(|p| p.user_id == alice_id).unwrap();
    assert_eq!(alice_seen.cursor, Some(CursorPosition::new(2, 2)));
}
