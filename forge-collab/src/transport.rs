//! Client side of the relay connection.
//!
//! One background task per room connection, driven as an explicit state
//! machine:
//!
//! ```text
//!              ┌───────────── backoff (250ms · 2ⁿ, ≤ 10s) ◄──────────┐
//!              ▼                                                     │
//! Disconnected ──► Connecting ──► Resyncing ──► Connected ── drop ───┘
//!                                    ▲              │
//!                                    └── overflow ──┘
//! ```
//!
//! On every connect the task announces itself, asks the relay for what it
//! is missing (`SyncStep1`), and replays every local update the relay has not
//! acknowledged yet. Local edits never wait for the network: they live in the
//! [`DocumentStore`] until acknowledged, so a dropped connection loses
//! nothing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::document::{ChangeOrigin, DocChange, DocumentError, DocumentStore, LocalUpdate, Subscription};
use crate::presence::{AwarenessMessage, CursorPosition, PeerPresence, PresenceRoom, SelectionRange};
use crate::protocol::{room_doc_id, MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::sequencer::{Admission, PeerSequencer, DEFAULT_MAX_HELD};
use forge_core::ParticipantRole;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub initial_backoff: Duration,
    pub backoff_factor: u32,
    pub max_backoff: Duration,
    /// Consecutive failed connects before `ConnectionLost` is reported.
    pub reconnect_surface_after: u32,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// No frame for this long means the connection is gone.
    pub heartbeat_timeout: Duration,
    /// Out-of-order deltas held per peer before asking for a full resync.
    pub max_held_per_peer: usize,
    pub role: ParticipantRole,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            backoff_factor: 2,
            max_backoff: Duration::from_secs(10),
            reconnect_surface_after: 5,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            max_held_per_peer: DEFAULT_MAX_HELD,
            role: ParticipantRole::Editor,
        }
    }
}

impl TransportConfig {
    /// Delay before the next connect after `failures` consecutive failures.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let factor = self.backoff_factor.max(1).saturating_pow(failures.min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected; waiting for the relay's state to be merged.
    Resyncing,
    Connected,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection lost after {attempts} attempts: {reason}")]
    ConnectionLost { attempts: u32, reason: String },
    #[error("transport closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
    /// A peer's deltas fell too far out of order; full state was requested.
    ResyncRequested(Uuid),
    /// Reconnecting keeps failing. The transport keeps trying.
    Error(TransportError),
}

/// A remote update after it was merged into the document.
#[derive(Debug, Clone)]
pub struct RemoteUpdate {
    /// Originating peer; nil for relay state syncs.
    pub peer_id: Uuid,
    pub clock: u64,
    /// Visible change, if the merge changed the text.
    pub change: Option<DocChange>,
}

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Listeners {
    updates: Mutex<Vec<Callback<RemoteUpdate>>>,
    presence: Mutex<Vec<Callback<AwarenessMessage>>>,
    events: Mutex<Vec<Callback<TransportEvent>>>,
}

impl Listeners {
    fn new() -> Self {
        Self {
            updates: Mutex::new(Vec::new()),
            presence: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    fn emit<T>(list: &Mutex<Vec<Callback<T>>>, value: &T) {
        if let Ok(list) = list.lock() {
            for cb in list.iter() {
                cb(value);
            }
        }
    }

    fn push<T>(list: &Mutex<Vec<Callback<T>>>, cb: Callback<T>) {
        if let Ok(mut list) = list.lock() {
            list.push(cb);
        }
    }
}

enum Command {
    Delta(LocalUpdate),
    Awareness(AwarenessMessage),
    Disconnect(oneshot::Sender<()>),
}

/// Entry point; see [`RelayTransport::connect`].
pub struct RelayTransport;

impl RelayTransport {
    /// Start maintaining a connection to `endpoint` for `room`.
    ///
    /// Returns immediately; the connection is made in the background. Must
    /// be called from within a tokio runtime.
    pub fn connect(
        config: TransportConfig,
        endpoint: impl Into<String>,
        room: &str,
        peer: PeerInfo,
        document: Arc<DocumentStore>,
    ) -> TransportHandle {
        let doc_id = room_doc_id(room);
        if document.doc_id() != doc_id {
            log::debug!("document {} bound to room '{}' ({})", document.doc_id(), room, doc_id);
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let listeners = Arc::new(Listeners::new());
        let presence = Arc::new(Mutex::new(PresenceRoom::new(peer.peer_id)));

        let forward = cmd_tx.clone();
        let local_sub = document.subscribe(move |change| {
            if let ChangeOrigin::Local { update, .. } = &change.origin {
                let _ = forward.send(Command::Delta(update.clone()));
            }
        });

        let join = presence
            .lock()
            .map(|p| p.join_message(peer.name.clone(), config.role))
            .ok();

        let worker = Worker {
            endpoint: endpoint.into(),
            peer_id: peer.peer_id,
            peer_name: peer.name.clone(),
            doc_id,
            document,
            commands: cmd_rx,
            state_tx,
            listeners: listeners.clone(),
            presence: presence.clone(),
            sequencer: PeerSequencer::new(config.max_held_per_peer),
            join,
            last_cursor: None,
            last_selection: None,
            config,
        };
        let task = tokio::spawn(worker.run());

        TransportHandle {
            peer_id: peer.peer_id,
            doc_id,
            commands: cmd_tx,
            state_rx,
            listeners,
            presence,
            task: Mutex::new(Some(task)),
            _local_changes: local_sub,
        }
    }
}

/// Handle to a room connection. Dropping it stops the background task.
pub struct TransportHandle {
    peer_id: Uuid,
    doc_id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    listeners: Arc<Listeners>,
    presence: Arc<Mutex<PresenceRoom>>,
    task: Mutex<Option<JoinHandle<()>>>,
    _local_changes: Subscription,
}

impl TransportHandle {
    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Queue a local update for the relay. Local document changes are
    /// already forwarded automatically; resending one is harmless.
    pub fn send(&self, update: LocalUpdate) -> Result<(), TransportError> {
        self.commands
            .send(Command::Delta(update))
            .map_err(|_| TransportError::Closed)
    }

    /// Send a presence frame. Best effort.
    pub fn send_awareness(&self, msg: AwarenessMessage) -> Result<(), TransportError> {
        self.commands
            .send(Command::Awareness(msg))
            .map_err(|_| TransportError::Closed)
    }

    /// Move the local caret; throttled to the presence rate limit.
    pub fn update_cursor(&self, position: CursorPosition) -> Result<(), TransportError> {
        let msg = match self.presence.lock() {
            Ok(mut p) => p.update_local_cursor(position),
            Err(_) => None,
        };
        match msg {
            Some(msg) => self.send_awareness(msg),
            None => Ok(()),
        }
    }

    pub fn update_selection(&self, range: Option<SelectionRange>) -> Result<(), TransportError> {
        let msg = match self.presence.lock() {
            Ok(mut p) => p.update_local_selection(range),
            Err(_) => return Ok(()),
        };
        self.send_awareness(msg)
    }

    /// Snapshot of the remote participants.
    pub fn peers(&self) -> Vec<PeerPresence> {
        match self.presence.lock() {
            Ok(p) => p.peers().values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Called after each remote update is merged into the document.
    pub fn on_update<F>(&self, listener: F)
    where
        F: Fn(&RemoteUpdate) + Send + Sync + 'static,
    {
        Listeners::push(&self.listeners.updates, Box::new(listener));
    }

    /// Called for every accepted presence change, including departures.
    pub fn on_peer_presence<F>(&self, listener: F)
    where
        F: Fn(&AwarenessMessage) + Send + Sync + 'static,
    {
        Listeners::push(&self.listeners.presence, Box::new(listener));
    }

    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        Listeners::push(&self.listeners.events, Box::new(listener));
    }

    /// Leave the room and stop reconnecting. Safe to call more than once.
    pub async fn disconnect(&self) {
        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        let Some(task) = task else { return };

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        let _ = task.await;
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Background task
// ───────────────────────────────────────────────────────────────────

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

struct Worker {
    config: TransportConfig,
    endpoint: String,
    peer_id: Uuid,
    peer_name: String,
    doc_id: Uuid,
    document: Arc<DocumentStore>,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    listeners: Arc<Listeners>,
    presence: Arc<Mutex<PresenceRoom>>,
    sequencer: PeerSequencer,
    join: Option<AwarenessMessage>,
    last_cursor: Option<AwarenessMessage>,
    last_selection: Option<AwarenessMessage>,
}

impl Worker {
    async fn run(mut self) {
        let mut failures: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);

            let endpoint = self.endpoint.clone();
            let connect = tokio::time::timeout(
                self.config.connect_timeout,
                tokio_tungstenite::connect_async(endpoint),
            );
            tokio::pin!(connect);

            let result = loop {
                tokio::select! {
                    res = &mut connect => break res,
                    cmd = self.commands.recv() => {
                        if !self.absorb_offline(cmd) {
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                    }
                }
            };

            let reason = match result {
                Ok(Ok((ws, _))) => {
                    failures = 0;
                    match self.session(ws).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Dropped(reason) => reason,
                    }
                }
                Ok(Err(e)) => {
                    failures += 1;
                    e.to_string()
                }
                Err(_) => {
                    failures += 1;
                    "connect timed out".to_string()
                }
            };

            self.set_state(ConnectionState::Disconnected);
            let delay = self.config.backoff_delay(failures);
            log::warn!(
                "relay {}: {} (attempt {}), reconnecting in {:?}",
                self.endpoint,
                reason,
                failures,
                delay
            );
            if failures == self.config.reconnect_surface_after {
                self.emit(TransportEvent::Error(TransportError::ConnectionLost {
                    attempts: failures,
                    reason,
                }));
            }

            if !self.wait_offline(delay).await {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    /// Sleep for `delay` while handling commands. False means stop.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.commands.recv() => {
                    if !self.absorb_offline(cmd) {
                        return false;
                    }
                }
            }
        }
    }

    /// Handle a command while there is no connection. False means stop.
    fn absorb_offline(&mut self, cmd: Option<Command>) -> bool {
        match cmd {
            None => false,
            Some(Command::Disconnect(ack)) => {
                let _ = ack.send(());
                false
            }
            // Still pending in the document; replayed on reconnect.
            Some(Command::Delta(_)) => true,
            Some(Command::Awareness(msg)) => {
                self.remember(&msg);
                true
            }
        }
    }

    fn remember(&mut self, msg: &AwarenessMessage) {
        match msg {
            AwarenessMessage::Join { .. } => self.join = Some(msg.clone()),
            AwarenessMessage::Cursor { .. } => self.last_cursor = Some(msg.clone()),
            AwarenessMessage::Selection { .. } => self.last_selection = Some(msg.clone()),
            AwarenessMessage::Leave { .. } => {}
        }
    }

    async fn session(&mut self, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> SessionEnd {
        let (mut tx, mut rx) = ws.split();
        self.set_state(ConnectionState::Resyncing);
        self.sequencer = PeerSequencer::new(self.config.max_held_per_peer);

        if let Err(e) = self.announce(&mut tx).await {
            return SessionEnd::Dropped(e.to_string());
        }

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deadline = Instant::now() + self.config.heartbeat_timeout;

        loop {
            tokio::select! {
                msg = rx.next() => {
                    deadline = Instant::now() + self.config.heartbeat_timeout;
                    let result = match msg {
                        Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                            Ok(frame) => self.handle_frame(&mut tx, frame).await,
                            Err(e) => {
                                log::warn!("relay sent an undecodable frame: {e}");
                                Ok(())
                            }
                        },
                        Some(Ok(Message::Ping(data))) => tx.send(Message::Pong(data)).await.map_err(Into::into),
                        Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped("closed by relay".into()),
                        Some(Ok(_)) => Ok(()),
                        Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                    };
                    if let Err(e) = result {
                        return SessionEnd::Dropped(e.to_string());
                    }
                }

                cmd = self.commands.recv() => {
                    let result = match cmd {
                        None => return SessionEnd::Shutdown,
                        Some(Command::Disconnect(ack)) => {
                            self.leave(&mut tx).await;
                            let _ = ack.send(());
                            return SessionEnd::Shutdown;
                        }
                        Some(Command::Delta(update)) => {
                            let frame = SyncMessage::delta(self.peer_id, self.doc_id, update.seq, update.update);
                            send_frame(&mut tx, &frame).await
                        }
                        Some(Command::Awareness(msg)) => {
                            self.remember(&msg);
                            self.send_awareness(&mut tx, &msg).await
                        }
                    };
                    if let Err(e) = result {
                        return SessionEnd::Dropped(e.to_string());
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = self.heartbeat(&mut tx).await {
                        return SessionEnd::Dropped(e.to_string());
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    return SessionEnd::Dropped("heartbeat timeout".into());
                }
            }
        }
    }

    /// Join, request missing state, replay unacknowledged updates.
    async fn announce(&mut self, tx: &mut WsSink) -> Result<(), TransportError> {
        let pending = self.document.pending_updates();
        let next_clock = pending
            .first()
            .map(|u| u.seq)
            .unwrap_or_else(|| self.document.next_local_seq());

        let info = PeerInfo {
            peer_id: self.peer_id,
            name: self.peer_name.clone(),
            next_clock,
        };
        send_frame(tx, &SyncMessage::peer_joined(self.doc_id, &info)?).await?;

        let sv = self.document.state_vector()?;
        send_frame(tx, &SyncMessage::sync_step1(self.peer_id, self.doc_id, sv)).await?;

        if !pending.is_empty() {
            log::info!("replaying {} unacknowledged updates from clock {}", pending.len(), next_clock);
        }
        for update in pending {
            let frame = SyncMessage::delta(self.peer_id, self.doc_id, update.seq, update.update);
            send_frame(tx, &frame).await?;
        }

        self.send_presence_state(tx).await
    }

    async fn send_presence_state(&mut self, tx: &mut WsSink) -> Result<(), TransportError> {
        let frames: Vec<AwarenessMessage> = [&self.join, &self.last_cursor, &self.last_selection]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        for msg in frames {
            self.send_awareness(tx, &msg).await?;
        }
        Ok(())
    }

    async fn send_awareness(&self, tx: &mut WsSink, msg: &AwarenessMessage) -> Result<(), TransportError> {
        let frame = SyncMessage::awareness(self.peer_id, self.doc_id, msg)?;
        send_frame(tx, &frame).await
    }

    async fn heartbeat(&mut self, tx: &mut WsSink) -> Result<(), TransportError> {
        send_frame(tx, &SyncMessage::ping(self.peer_id)).await?;
        // Presence is best effort; refresh it so peers do not expire us.
        self.send_presence_state(tx).await?;

        let stale = match self.presence.lock() {
            Ok(mut p) => p.cleanup_idle_peers(),
            Err(_) => Vec::new(),
        };
        for user_id in stale {
            log::debug!("presence of {user_id} expired");
            Listeners::emit(&self.listeners.presence, &AwarenessMessage::Leave { user_id });
        }
        Ok(())
    }

    async fn leave(&mut self, tx: &mut WsSink) {
        let leave = match self.presence.lock() {
            Ok(p) => p.leave_message(),
            Err(_) => AwarenessMessage::Leave { user_id: self.peer_id },
        };
        let _ = self.send_awareness(tx, &leave).await;
        let _ = tx.close().await;
        log::info!("left room {}", self.doc_id);
    }

    async fn handle_frame(&mut self, tx: &mut WsSink, frame: SyncMessage) -> Result<(), TransportError> {
        if frame.peer_id == self.peer_id {
            return Ok(());
        }
        if !frame.from_relay() {
            if let Ok(mut p) = self.presence.lock() {
                p.mark_seen(frame.peer_id);
            }
        }

        match frame.msg_type {
            MessageType::Delta => {
                let peer = frame.peer_id;
                let clock = frame.clock;
                match self.sequencer.admit(peer, clock, frame.payload) {
                    Admission::Deliver(updates) => self.merge_all(peer, clock, updates),
                    Admission::Duplicate => log::trace!("duplicate delta {clock} from {peer}"),
                    Admission::Held => log::trace!("holding delta {clock} from {peer}"),
                    Admission::Overflow => {
                        self.emit(TransportEvent::ResyncRequested(peer));
                        self.set_state(ConnectionState::Resyncing);
                        let sv = self.document.state_vector()?;
                        send_frame(tx, &SyncMessage::sync_step1(self.peer_id, self.doc_id, sv)).await?;
                    }
                }
            }

            MessageType::SyncStep1 => {
                let diff = self.document.diff_since(&frame.payload)?;
                send_frame(tx, &SyncMessage::sync_step2(self.peer_id, self.doc_id, diff)).await?;
            }

            MessageType::SyncStep2 => {
                self.merge(frame.peer_id, 0, &frame.payload);
                if self.state() == ConnectionState::Resyncing {
                    self.set_state(ConnectionState::Connected);
                }
            }

            MessageType::Watermarks => {
                let marks = frame.watermark_list()?;
                let released = self.sequencer.apply_watermarks(&marks);
                for update in released {
                    self.merge(Uuid::nil(), 0, &update);
                }
            }

            MessageType::Ack => self.document.acknowledge(frame.clock),

            MessageType::PeerJoined => {
                let info = frame.peer_info()?;
                let released = self.sequencer.seed(info.peer_id, info.next_clock);
                self.merge_all(info.peer_id, info.next_clock, released);
                log::info!("peer {} ({}) joined", info.name, info.peer_id);
                self.emit(TransportEvent::PeerJoined(info));
            }

            MessageType::PeerLeft => {
                self.sequencer.forget(&frame.peer_id);
                let removed = match self.presence.lock() {
                    Ok(mut p) => p.remove_peer(frame.peer_id).is_some(),
                    Err(_) => false,
                };
                if removed {
                    let leave = AwarenessMessage::Leave { user_id: frame.peer_id };
                    Listeners::emit(&self.listeners.presence, &leave);
                }
                log::info!("peer {} left", frame.peer_id);
                self.emit(TransportEvent::PeerLeft(frame.peer_id));
            }

            MessageType::Awareness => {
                let msg = match frame.awareness_message() {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::debug!("dropping malformed awareness from {}: {e}", frame.peer_id);
                        return Ok(());
                    }
                };
                let changed = match self.presence.lock() {
                    Ok(mut p) => p.handle_message(frame.peer_id, &msg),
                    Err(_) => false,
                };
                if changed {
                    Listeners::emit(&self.listeners.presence, &msg);
                }
            }

            MessageType::Ping | MessageType::Pong => {}
        }
        Ok(())
    }

    fn merge_all(&self, peer_id: Uuid, first_clock: u64, updates: Vec<Vec<u8>>) {
        for (i, update) in updates.iter().enumerate() {
            let clock = if first_clock == 0 { 0 } else { first_clock + i as u64 };
            self.merge(peer_id, clock, update);
        }
    }

    /// Merge into the document. Rejected updates are logged by the store and
    /// otherwise ignored.
    fn merge(&self, peer_id: Uuid, clock: u64, update: &[u8]) {
        match self.document.apply_remote(update) {
            Ok(change) => {
                let remote = RemoteUpdate { peer_id, clock, change };
                Listeners::emit(&self.listeners.updates, &remote);
            }
            Err(e) => log::warn!("update {clock} from {peer_id} not merged: {e}"),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        if self.state() == state {
            return;
        }
        log::info!("room {}: {:?} -> {:?}", self.doc_id, self.state(), state);
        self.state_tx.send_replace(state);
        self.emit(TransportEvent::StateChanged(state));
    }

    fn emit(&self, event: TransportEvent) {
        Listeners::emit(&self.listeners.events, &event);
    }
}

async fn send_frame(tx: &mut WsSink, frame: &SyncMessage) -> Result<(), TransportError> {
    tx.send(Message::Binary(frame.encode()?.into())).await?;
    Ok(())
}
