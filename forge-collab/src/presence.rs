//! Awareness: who is in the room and where their caret is.
//!
//! ```text
//! local caret move
//!       │
//!       ▼
//! PresenceRoom::update_local_cursor()   (rate-limited: 33ms)
//!       │
//!       ▼
//! AwarenessMessage::Cursor { … }  ──►  relay  ──►  remote PresenceRoom::handle_message()
//! ```
//!
//! Presence is best-effort: frames may be dropped or arrive out of order.
//! Each sender stamps its cursor frames with a monotonic counter and
//! receivers discard anything older than what they already hold.

use forge_core::{CursorLocation, ParticipantRole};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Zero-based caret position in a text buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

impl CursorPosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }

    /// Position of byte `offset` inside `text`. Columns count characters.
    /// Offsets past the end clamp to the end of the text.
    pub fn from_offset(text: &str, offset: usize) -> Self {
        let mut end = offset.min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let before = &text[..end];
        let line = before.matches('\n').count() as u32;
        let line_start = before.rfind('\n').map_or(0, |i| i + 1);
        let column = before[line_start..].chars().count() as u32;
        Self { line, column }
    }
}

impl From<CursorPosition> for CursorLocation {
    fn from(pos: CursorPosition) -> Self {
        CursorLocation {
            line: pos.line,
            column: pos.column,
        }
    }
}

/// Selected span; `anchor` is where the selection started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub anchor: CursorPosition,
    pub head: CursorPosition,
}

impl SelectionRange {
    pub fn is_empty(&self) -> bool {
        self.anchor == self.head
    }
}

/// Awareness frames, carried inside `SyncMessage::Awareness` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    Join {
        user_id: Uuid,
        user_name: String,
        role: ParticipantRole,
    },

    Leave {
        user_id: Uuid,
    },

    /// Caret update (high frequency, rate-limited).
    Cursor {
        user_id: Uuid,
        position: CursorPosition,
        /// Per-sender monotonic counter.
        timestamp: u64,
    },

    /// `None` clears the selection.
    Selection {
        user_id: Uuid,
        range: Option<SelectionRange>,
    },
}

impl AwarenessMessage {
    /// Participant whose record this frame writes.
    pub fn user_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Join { user_id, .. }
            | AwarenessMessage::Leave { user_id }
            | AwarenessMessage::Cursor { user_id, .. }
            | AwarenessMessage::Selection { user_id, .. } => *user_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Minimum interval between cursor broadcasts.
    pub cursor_interval: Duration,
    /// Records with no traffic for this long are dropped.
    pub idle_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            cursor_interval: Duration::from_millis(33),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// A remote participant's awareness record.
#[derive(Debug, Clone)]
pub struct PeerPresence {
    pub user_id: Uuid,
    pub user_name: String,
    pub role: ParticipantRole,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionRange>,
    last_seen: Instant,
    last_timestamp: u64,
}

impl PeerPresence {
    fn new(user_id: Uuid, user_name: String, role: ParticipantRole) -> Self {
        Self {
            user_id,
            user_name,
            role,
            cursor: None,
            selection: None,
            last_seen: Instant::now(),
            last_timestamp: 0,
        }
    }

    /// Placeholder for a peer whose `Join` we missed.
    fn unnamed(user_id: Uuid) -> Self {
        let short = user_id.simple().to_string();
        Self::new(user_id, format!("Peer-{}", &short[..8]), ParticipantRole::Editor)
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Returns false for stale timestamps.
    fn update_cursor(&mut self, position: CursorPosition, timestamp: u64) -> bool {
        if timestamp < self.last_timestamp {
            return false;
        }
        self.cursor = Some(position);
        self.last_timestamp = timestamp;
        true
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Awareness state of every remote participant in one room.
pub struct PresenceRoom {
    local_user_id: Uuid,
    peers: HashMap<Uuid, PeerPresence>,
    config: PresenceConfig,
    last_cursor_broadcast: Option<Instant>,
    local_cursor: CursorPosition,
    local_selection: Option<SelectionRange>,
    timestamp_counter: u64,
}

impl PresenceRoom {
    pub fn new(local_user_id: Uuid) -> Self {
        Self::with_config(local_user_id, PresenceConfig::default())
    }

    pub fn with_config(local_user_id: Uuid, config: PresenceConfig) -> Self {
        Self {
            local_user_id,
            peers: HashMap::new(),
            config,
            last_cursor_broadcast: None,
            local_cursor: CursorPosition::default(),
            local_selection: None,
            timestamp_counter: 0,
        }
    }

    /// Apply an incoming frame sent by `sender`.
    ///
    /// Returns whether any record changed. Frames about another participant
    /// than their sender, frames about ourselves and stale cursors are ignored.
    pub fn handle_message(&mut self, sender: Uuid, msg: &AwarenessMessage) -> bool {
        let user_id = msg.user_id();
        if user_id == self.local_user_id {
            return false;
        }
        if user_id != sender {
            log::warn!("dropping awareness for {} sent by {}", user_id, sender);
            return false;
        }

        match msg {
            AwarenessMessage::Join { user_name, role, .. } => {
                let peer = self
                    .peers
                    .entry(user_id)
                    .or_insert_with(|| PeerPresence::new(user_id, user_name.clone(), *role));
                peer.user_name = user_name.clone();
                peer.role = *role;
                peer.touch();
                true
            }

            AwarenessMessage::Leave { .. } => self.peers.remove(&user_id).is_some(),

            AwarenessMessage::Cursor { position, timestamp, .. } => {
                let peer = self
                    .peers
                    .entry(user_id)
                    .or_insert_with(|| PeerPresence::unnamed(user_id));
                peer.touch();
                peer.update_cursor(*position, *timestamp)
            }

            AwarenessMessage::Selection { range, .. } => {
                let peer = self
                    .peers
                    .entry(user_id)
                    .or_insert_with(|| PeerPresence::unnamed(user_id));
                peer.touch();
                peer.selection = *range;
                true
            }
        }
    }

    /// Record any traffic from `user_id` as a sign of life.
    pub fn mark_seen(&mut self, user_id: Uuid) {
        if let Some(peer) = self.peers.get_mut(&user_id) {
            peer.touch();
        }
    }

    /// Drop a participant, e.g. on relay `PeerLeft`.
    pub fn remove_peer(&mut self, user_id: Uuid) -> Option<PeerPresence> {
        self.peers.remove(&user_id)
    }

    /// Move the local caret; returns a frame unless throttled.
    pub fn update_local_cursor(&mut self, position: CursorPosition) -> Option<AwarenessMessage> {
        self.local_cursor = position;
        if let Some(last) = self.last_cursor_broadcast {
            if last.elapsed() < self.config.cursor_interval {
                return None;
            }
        }
        Some(self.force_cursor_broadcast())
    }

    /// Cursor frame for the current caret, ignoring the rate limit.
    pub fn force_cursor_broadcast(&mut self) -> AwarenessMessage {
        self.timestamp_counter += 1;
        self.last_cursor_broadcast = Some(Instant::now());
        AwarenessMessage::Cursor {
            user_id: self.local_user_id,
            position: self.local_cursor,
            timestamp: self.timestamp_counter,
        }
    }

    pub fn update_local_selection(&mut self, range: Option<SelectionRange>) -> AwarenessMessage {
        self.local_selection = range;
        AwarenessMessage::Selection {
            user_id: self.local_user_id,
            range,
        }
    }

    pub fn join_message(&self, user_name: impl Into<String>, role: ParticipantRole) -> AwarenessMessage {
        AwarenessMessage::Join {
            user_id: self.local_user_id,
            user_name: user_name.into(),
            role,
        }
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            user_id: self.local_user_id,
        }
    }

    pub fn peers(&self) -> &HashMap<Uuid, PeerPresence> {
        &self.peers
    }

    pub fn peer(&self, user_id: &Uuid) -> Option<&PeerPresence> {
        self.peers.get(user_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Remove peers idle longer than the configured timeout.
    pub fn cleanup_idle_peers(&mut self) -> Vec<Uuid> {
        let timeout = self.config.idle_timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_idle(timeout))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn local_user_id(&self) -> Uuid {
        self.local_user_id
    }

    pub fn local_cursor(&self) -> CursorPosition {
        self.local_cursor
    }

    pub fn local_selection(&self) -> Option<SelectionRange> {
        self.local_selection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(id: Uuid, name: &str) -> AwarenessMessage {
        AwarenessMessage::Join {
            user_id: id,
            user_name: name.to_string(),
            role: ParticipantRole::Editor,
        }
    }

    #[test]
    fn test_from_offset() {
        let text = "fn main() {\n    ok\n}";
        assert_eq!(CursorPosition::from_offset(text, 0), CursorPosition::new(0, 0));
        assert_eq!(CursorPosition::from_offset(text, 12), CursorPosition::new(1, 0));
        assert_eq!(CursorPosition::from_offset(text, 16), CursorPosition::new(1, 4));
        assert_eq!(CursorPosition::from_offset(text, 999), CursorPosition::new(2, 1));
    }

    #[test]
    fn test_from_offset_counts_chars() {
        // 'é' is two bytes; offset 3 lands right after it.
        let text = "aé b";
        assert_eq!(CursorPosition::from_offset(text, 3), CursorPosition::new(0, 2));
        // Mid-character offsets snap back to the boundary.
        assert_eq!(CursorPosition::from_offset(text, 2), CursorPosition::new(0, 1));
    }

    #[test]
    fn test_join_and_leave() {
        let mut room = PresenceRoom::new(Uuid::new_v4());
        let peer = Uuid::new_v4();

        assert!(room.handle_message(peer, &join(peer, "Alice")));
        assert_eq!(room.peer(&peer).map(|p| p.user_name.as_str()), Some("Alice"));

        assert!(room.handle_message(peer, &AwarenessMessage::Leave { user_id: peer }));
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_ignores_own_messages() {
        let me = Uuid::new_v4();
        let mut room = PresenceRoom::new(me);
        assert!(!room.handle_message(me, &join(me, "me")));
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_cannot_overwrite_other_record() {
        let mut room = PresenceRoom::new(Uuid::new_v4());
        let alice = Uuid::new_v4();
        let mallory = Uuid::new_v4();
        room.handle_message(alice, &join(alice, "Alice"));

        let spoof = AwarenessMessage::Cursor {
            user_id: alice,
            position: CursorPosition::new(9, 9),
            timestamp: 100,
        };
        assert!(!room.handle_message(mallory, &spoof));
        assert!(!room.handle_message(mallory, &AwarenessMessage::Leave { user_id: alice }));

        let alice_rec = room.peer(&alice).unwrap();
        assert_eq!(alice_rec.cursor, None);
    }

    #[test]
    fn test_stale_cursor_rejected() {
        let mut room = PresenceRoom::new(Uuid::new_v4());
        let peer = Uuid::new_v4();
        room.handle_message(peer, &join(peer, "Bob"));

        let at = |line, timestamp| AwarenessMessage::Cursor {
            user_id: peer,
            position: CursorPosition::new(line, 0),
            timestamp,
        };
        assert!(room.handle_message(peer, &at(5, 10)));
        assert!(!room.handle_message(peer, &at(1, 3)));
        assert_eq!(room.peer(&peer).unwrap().cursor, Some(CursorPosition::new(5, 0)));
    }

    #[test]
    fn test_cursor_before_join_creates_placeholder() {
        let mut room = PresenceRoom::new(Uuid::new_v4());
        let peer = Uuid::new_v4();
        let msg = AwarenessMessage::Cursor {
            user_id: peer,
            position: CursorPosition::new(2, 3),
            timestamp: 1,
        };
        assert!(room.handle_message(peer, &msg));
        assert!(room.peer(&peer).unwrap().user_name.starts_with("Peer-"));
    }

    #[test]
    fn test_selection_update_and_clear() {
        let mut room = PresenceRoom::new(Uuid::new_v4());
        let peer = Uuid::new_v4();
        let range = SelectionRange {
            anchor: CursorPosition::new(0, 0),
            head: CursorPosition::new(0, 5),
        };
        room.handle_message(peer, &AwarenessMessage::Selection { user_id: peer, range: Some(range) });
        assert_eq!(room.peer(&peer).unwrap().selection, Some(range));

        room.handle_message(peer, &AwarenessMessage::Selection { user_id: peer, range: None });
        assert_eq!(room.peer(&peer).unwrap().selection, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_rate_limit() {
        let mut room = PresenceRoom::new(Uuid::new_v4());

        assert!(room.update_local_cursor(CursorPosition::new(0, 1)).is_some());
        assert!(room.update_local_cursor(CursorPosition::new(0, 2)).is_none());

        tokio::time::advance(Duration::from_millis(34)).await;
        match room.update_local_cursor(CursorPosition::new(0, 3)) {
            Some(AwarenessMessage::Cursor { position, timestamp, .. }) => {
                assert_eq!(position, CursorPosition::new(0, 3));
                assert_eq!(timestamp, 2);
            }
            other => panic!("expected cursor frame, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_cleanup() {
        let mut room = PresenceRoom::with_config(
            Uuid::new_v4(),
            PresenceConfig {
                idle_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        );
        let quiet = Uuid::new_v4();
        let chatty = Uuid::new_v4();
        room.handle_message(quiet, &join(quiet, "quiet"));
        room.handle_message(chatty, &join(chatty, "chatty"));

        tokio::time::advance(Duration::from_secs(4)).await;
        room.mark_seen(chatty);
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(room.cleanup_idle_peers(), vec![quiet]);
        assert!(room.peer(&chatty).is_some());
    }
}
