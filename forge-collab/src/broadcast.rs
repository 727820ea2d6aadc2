//! Per-room fan-out.
//!
//! One tokio broadcast channel per room; every connection holds a receiver
//! that buffers up to `capacity` frames. Frames are encoded once and shared.
//! A receiver that falls further behind than `capacity` lags and loses
//! frames; the relay logs it and the client recovers through resync.
//!
//! Membership is keyed by peer id but owned by a connection: a peer that
//! reconnects takes its seat over, and the old connection can no longer
//! remove it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// An encoded frame plus the peer it came from, so receivers can skip
/// their own frames without decoding.
#[derive(Debug)]
pub struct Envelope {
    pub sender: Uuid,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_peers: usize,
}

/// One websocket connection's claim on a peer id.
pub type ConnectionId = u64;

struct Member {
    connection: ConnectionId,
    info: PeerInfo,
}

/// Fan-out group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    peers: RwLock<HashMap<Uuid, Member>>,
    next_connection: AtomicU64,
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            messages_sent: AtomicU64::new(0),
            messages_lagged: AtomicU64::new(0),
        }
    }

    /// Register a peer for a new connection and return the connection's id
    /// and receiver. A peer already present is taken over.
    pub async fn add_peer(&self, info: PeerInfo) -> (ConnectionId, broadcast::Receiver<Arc<Envelope>>) {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, Member { connection, info });
        (connection, self.sender.subscribe())
    }

    /// Remove `peer_id` if `connection` still owns it.
    pub async fn remove_peer(&self, peer_id: &Uuid, connection: ConnectionId) -> Option<PeerInfo> {
        let mut peers = self.peers.write().await;
        match peers.get(peer_id) {
            Some(member) if member.connection == connection => peers.remove(peer_id).map(|m| m.info),
            _ => None,
        }
    }

    /// Encode once and send to every receiver, the sender's included.
    /// Filtering out the sender is the receiver's job.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let envelope = Envelope {
            sender: msg.peer_id,
            bytes: msg.encode()?,
        };
        Ok(self.broadcast_raw(Arc::new(envelope)))
    }

    /// Send an already-encoded frame.
    pub fn broadcast_raw(&self, envelope: Arc<Envelope>) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Count frames a lagging receiver lost.
    pub fn record_lag(&self, skipped: u64) {
        self.messages_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().map(|m| m.info.clone()).collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.messages_lagged.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }
}
