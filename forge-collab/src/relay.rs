//! WebSocket relay with room-based document routing.
//!
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── DocumentStore ── BroadcastGroup
//! Client B ──┘        │
//!                     └── watermarks: peer_id → last integrated clock
//! ```
//!
//! The relay keeps an authoritative copy of each room's document so that a
//! (re)connecting client can be brought up to date, and remembers the last
//! delta clock it integrated from each peer. Both are in memory only; a room
//! is dropped when its last peer leaves, and clients restore it through the
//! two-way resync on their next connect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, ConnectionId, Envelope};
use crate::document::DocumentStore;
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage, Watermark};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Frames buffered per connection before it is considered lagging.
    pub broadcast_capacity: usize,
    /// Connections silent for this long are dropped.
    pub heartbeat_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_timeout: Duration::from_secs(45),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("room {0} is full")]
    RoomFull(Uuid),
}

struct Room {
    doc: DocumentStore,
    broadcast: Arc<BroadcastGroup>,
    watermarks: Mutex<HashMap<Uuid, u64>>,
}

impl Room {
    fn new(doc_id: Uuid, capacity: usize) -> Self {
        Self {
            doc: DocumentStore::new(doc_id),
            broadcast: Arc::new(BroadcastGroup::new(capacity)),
            watermarks: Mutex::new(HashMap::new()),
        }
    }
}

/// A joined connection.
struct PeerSession {
    peer_id: Uuid,
    connection: ConnectionId,
    doc_id: Uuid,
    room: Arc<Room>,
    rx: broadcast::Receiver<Arc<Envelope>>,
}

struct Shared {
    config: RelayConfig,
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    stats: RwLock<RelayStats>,
}

/// The relay server. Cheap to clone; clones share rooms and stats.
#[derive(Clone)]
pub struct RelayServer {
    shared: Arc<Shared>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                rooms: RwLock::new(HashMap::new()),
                stats: RwLock::new(RelayStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind `bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            let shared = self.shared.clone();
            tokio::spawn(async move {
                shared.handle_connection(stream, addr).await;
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.shared.stats.read().await.clone()
    }

    pub async fn room_count(&self) -> usize {
        self.shared.rooms.read().await.len()
    }

    /// Current text of a room's authoritative document.
    pub async fn room_text(&self, doc_id: &Uuid) -> Option<String> {
        let rooms = self.shared.rooms.read().await;
        rooms.get(doc_id).map(|room| room.doc.snapshot())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }
}

impl Shared {
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("WebSocket handshake with {addr} failed: {e}");
                return;
            }
        };
        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (mut ws_tx, mut ws_rx) = ws.split();
        let mut session: Option<PeerSession> = None;

        if let Err(e) = self.pump(&mut ws_tx, &mut ws_rx, &mut session, addr).await {
            log::warn!("Connection from {addr} ended with error: {e}");
        }

        if let Some(session) = session {
            self.leave(session).await;
        }
        let _ = ws_tx.close().await;
        self.stats.write().await.active_connections -= 1;
    }

    async fn pump(
        &self,
        ws_tx: &mut WsSink,
        ws_rx: &mut WsSource,
        session: &mut Option<PeerSession>,
        addr: SocketAddr,
    ) -> Result<(), RelayError> {
        let timeout = self.config.heartbeat_timeout;
        let mut deadline = Instant::now() + timeout;

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    deadline = Instant::now() + timeout;
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            self.stats.write().await.total_messages += 1;
                            let frame = match SyncMessage::decode(&data) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    continue;
                                }
                            };
                            for reply in self.handle_frame(session, frame).await? {
                                ws_tx.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_tx.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    }
                }

                env = async {
                    match session.as_mut() {
                        Some(s) => s.rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(s) = session.as_ref() else { continue };
                    match env {
                        Ok(env) => {
                            if env.sender != s.peer_id {
                                ws_tx.send(Message::Binary(env.bytes.clone().into())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            s.room.broadcast.record_lag(n);
                            log::warn!("Peer {} lagged by {n} frames, dropping it to force a resync", s.peer_id);
                            return Ok(());
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    log::info!("Connection from {addr} silent for {:?}, dropping", timeout);
                    return Ok(());
                }
            }
        }
    }

    /// Process one frame and return the frames to send back to its sender.
    async fn handle_frame(
        &self,
        session: &mut Option<PeerSession>,
        frame: SyncMessage,
    ) -> Result<Vec<SyncMessage>, RelayError> {
        if frame.msg_type == MessageType::Ping {
            return Ok(vec![SyncMessage::pong(Uuid::nil())]);
        }

        if session.is_none() {
            if frame.msg_type == MessageType::PeerJoined {
                return self.join(session, frame).await;
            }
            log::debug!("Ignoring {:?} before PeerJoined", frame.msg_type);
            return Ok(Vec::new());
        }
        let Some(s) = session.as_ref() else {
            return Ok(Vec::new());
        };

        if frame.peer_id != s.peer_id || frame.doc_id != s.doc_id {
            log::warn!(
                "Dropping {:?} claiming peer {} on a connection owned by {}",
                frame.msg_type,
                frame.peer_id,
                s.peer_id
            );
            return Ok(Vec::new());
        }

        match frame.msg_type {
            MessageType::Delta => Ok(integrate_delta(s, &frame).await?),

            MessageType::SyncStep1 => {
                let marks: Vec<Watermark> = {
                    let watermarks = s.room.watermarks.lock().await;
                    watermarks
                        .iter()
                        .map(|(peer_id, clock)| Watermark { peer_id: *peer_id, clock: *clock })
                        .collect()
                };
                // Computed after the watermarks, so the diff covers at least
                // every delta they name.
                match s.room.doc.diff_since(&frame.payload) {
                    Ok(diff) => Ok(vec![
                        SyncMessage::watermarks(s.doc_id, &marks)?,
                        SyncMessage::sync_step2(Uuid::nil(), s.doc_id, diff),
                    ]),
                    Err(e) => {
                        log::warn!("Peer {} sent a bad state vector: {e}", s.peer_id);
                        Ok(Vec::new())
                    }
                }
            }

            MessageType::SyncStep2 => {
                // The client's answer to our SyncStep1: whatever we lacked.
                if s.room.doc.apply_remote(&frame.payload).is_ok() {
                    let delta = SyncMessage::delta(s.peer_id, s.doc_id, 0, frame.payload);
                    s.room.broadcast.broadcast(&delta)?;
                }
                Ok(Vec::new())
            }

            MessageType::Awareness => {
                match frame.awareness_message() {
                    Ok(AwarenessMessage::Join { user_name, .. }) => {
                        log::info!("Presence: {user_name} joined room {}", s.doc_id);
                    }
                    Ok(AwarenessMessage::Leave { user_id }) => {
                        log::info!("Presence: {user_id} left room {}", s.doc_id);
                    }
                    Ok(_) => log::trace!("Presence update in room {}", s.doc_id),
                    Err(e) => {
                        log::warn!("Dropping malformed awareness from {}: {e}", s.peer_id);
                        return Ok(Vec::new());
                    }
                }
                s.room.broadcast.broadcast(&frame)?;
                Ok(Vec::new())
            }

            other => {
                log::debug!("Unhandled message type from {}: {:?}", s.peer_id, other);
                Ok(Vec::new())
            }
        }
    }

    async fn join(
        &self,
        session: &mut Option<PeerSession>,
        frame: SyncMessage,
    ) -> Result<Vec<SyncMessage>, RelayError> {
        let info = frame
            .peer_info()
            .unwrap_or_else(|_| PeerInfo::with_id(frame.peer_id, "anonymous"));
        let doc_id = frame.doc_id;

        let (room, connection, rx) = {
            let mut rooms = self.rooms.write().await;
            let room = rooms
                .entry(doc_id)
                .or_insert_with(|| Arc::new(Room::new(doc_id, self.config.broadcast_capacity)))
                .clone();
            let rejoining = room.broadcast.has_peer(&info.peer_id).await;
            if !rejoining && room.broadcast.peer_count().await >= self.config.max_peers_per_room {
                return Err(RelayError::RoomFull(doc_id));
            }
            let (connection, rx) = room.broadcast.add_peer(info.clone()).await;
            self.stats.write().await.active_rooms = rooms.len();
            (room, connection, rx)
        };

        room.broadcast.broadcast(&frame)?;
        log::info!(
            "Peer {} ({}) joined doc {} at clock {}",
            info.name,
            info.peer_id,
            doc_id,
            info.next_clock
        );

        // Ask for anything the client has that we do not.
        let sv = room
            .doc
            .state_vector()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        *session = Some(PeerSession {
            peer_id: info.peer_id,
            connection,
            doc_id,
            room,
            rx,
        });
        Ok(vec![SyncMessage::sync_step1(Uuid::nil(), doc_id, sv)])
    }

    async fn leave(&self, session: PeerSession) {
        let PeerSession {
            peer_id,
            connection,
            doc_id,
            room,
            ..
        } = session;
        let mut rooms = self.rooms.write().await;
        if room.broadcast.remove_peer(&peer_id, connection).await.is_none() {
            // The peer reconnected; its newer connection keeps the seat.
            log::debug!("Superseded connection of {peer_id} closed on doc {doc_id}");
            return;
        }
        if let Err(e) = room.broadcast.broadcast(&SyncMessage::peer_left(peer_id, doc_id)) {
            log::warn!("Failed to announce departure of {peer_id}: {e}");
        }
        if room.broadcast.peer_count().await == 0 {
            rooms.remove(&doc_id);
            log::info!("Room {doc_id} removed (empty)");
        }
        self.stats.write().await.active_rooms = rooms.len();
        log::info!("Peer {peer_id} left doc {doc_id}");
    }
}

/// Fold a delta into the room document, fan it out, and acknowledge it.
///
/// Clocks at or below the sender's watermark were integrated before (a
/// resend after reconnect); they are only acknowledged again.
async fn integrate_delta(s: &PeerSession, frame: &SyncMessage) -> Result<Vec<SyncMessage>, RelayError> {
    let mut watermarks = s.room.watermarks.lock().await;
    let mark = watermarks.entry(s.peer_id).or_insert(0);

    if frame.clock != 0 && frame.clock <= *mark {
        log::trace!("Peer {} resent clock {}", s.peer_id, frame.clock);
        return Ok(vec![SyncMessage::ack(s.doc_id, frame.clock)]);
    }

    // Rejected deltas are still fanned out and acknowledged: every clock
    // must reach the other peers' sequencers, and the sender must stop
    // resending it.
    if let Err(e) = s.room.doc.apply_remote(&frame.payload) {
        log::warn!("Peer {} delta {} rejected: {e}", s.peer_id, frame.clock);
    }
    s.room.broadcast.broadcast(frame)?;

    if frame.clock == 0 {
        return Ok(Vec::new());
    }
    *mark = frame.clock;
    Ok(vec![SyncMessage::ack(s.doc_id, frame.clock)])
}
