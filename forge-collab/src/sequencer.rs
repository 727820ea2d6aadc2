//! Per-peer causal delivery of document deltas.
//!
//! The relay gives no ordering guarantee, so every delta carries its
//! sender's clock. A peer's deltas are released to the document strictly in
//! clock order; deltas from different peers interleave freely.

use std::collections::{BTreeMap, HashMap};

use uuid::Uuid;

use crate::protocol::Watermark;

/// Held deltas per peer before the sequencer gives up and asks for a resync.
pub const DEFAULT_MAX_HELD: usize = 256;

/// What to do with an incoming delta.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Apply these updates, in order.
    Deliver(Vec<Vec<u8>>),
    /// Already delivered.
    Duplicate,
    /// Waiting for an earlier clock.
    Held,
    /// Too far behind; the held set was discarded. Request a full resync.
    Overflow,
}

#[derive(Debug, Default)]
struct PeerQueue {
    /// Next clock to deliver.
    expected: u64,
    held: BTreeMap<u64, Vec<u8>>,
}

impl PeerQueue {
    fn starting_at(expected: u64) -> Self {
        Self {
            expected,
            held: BTreeMap::new(),
        }
    }

    /// Move `expected` forward to at least `next`, then release what lines up.
    fn advance_to(&mut self, next: u64) -> Vec<Vec<u8>> {
        if next > self.expected {
            self.expected = next;
        }
        let keep = self.held.split_off(&self.expected);
        self.held = keep;
        self.drain_ready()
    }

    fn drain_ready(&mut self) -> Vec<Vec<u8>> {
        let mut ready = Vec::new();
        while let Some(update) = self.held.remove(&self.expected) {
            ready.push(update);
            self.expected = self.expected.saturating_add(1);
        }
        ready
    }
}

pub struct PeerSequencer {
    peers: HashMap<Uuid, PeerQueue>,
    max_held: usize,
}

impl Default for PeerSequencer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HELD)
    }
}

impl PeerSequencer {
    pub fn new(max_held: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_held,
        }
    }

    /// Admit a delta with `clock` from `peer`.
    ///
    /// Clock 0 is unsequenced and always delivered. The first delta from a
    /// peer with no known baseline sets that baseline.
    pub fn admit(&mut self, peer: Uuid, clock: u64, update: Vec<u8>) -> Admission {
        if clock == 0 {
            return Admission::Deliver(vec![update]);
        }

        let queue = self
            .peers
            .entry(peer)
            .or_insert_with(|| PeerQueue::starting_at(clock));

        if clock < queue.expected || queue.held.contains_key(&clock) {
            return Admission::Duplicate;
        }

        if clock > queue.expected {
            queue.held.insert(clock, update);
            if queue.held.len() > self.max_held {
                log::warn!(
                    "peer {}: {} deltas held waiting for clock {}, resyncing",
                    peer,
                    queue.held.len(),
                    queue.expected
                );
                self.peers.remove(&peer);
                return Admission::Overflow;
            }
            return Admission::Held;
        }

        let mut ready = vec![update];
        queue.expected += 1;
        ready.extend(queue.drain_ready());
        Admission::Deliver(ready)
    }

    /// Seed the baseline announced in a peer's `PeerJoined`.
    pub fn seed(&mut self, peer: Uuid, next_clock: u64) -> Vec<Vec<u8>> {
        match self.peers.get_mut(&peer) {
            Some(queue) => queue.advance_to(next_clock),
            None => {
                self.peers.insert(peer, PeerQueue::starting_at(next_clock));
                Vec::new()
            }
        }
    }

    /// Apply relay watermarks received ahead of a full-state sync.
    ///
    /// Everything at or below a watermark is contained in the sync payload.
    pub fn apply_watermarks(&mut self, marks: &[Watermark]) -> Vec<Vec<u8>> {
        let mut ready = Vec::new();
        for mark in marks {
            let next = mark.clock.saturating_add(1);
            let queue = self
                .peers
                .entry(mark.peer_id)
                .or_insert_with(|| PeerQueue::starting_at(next));
            ready.extend(queue.advance_to(next));
        }
        ready
    }

    /// Next clock expected from `peer`, if known.
    pub fn expected(&self, peer: &Uuid) -> Option<u64> {
        self.peers.get(peer).map(|q| q.expected)
    }

    pub fn held(&self, peer: &Uuid) -> usize {
        self.peers.get(peer).map_or(0, |q| q.held.len())
    }

    /// Drop everything known about a peer that left the room.
    pub fn forget(&mut self, peer: &Uuid) {
        self.peers.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(tag: u8) -> Vec<u8> {
        vec![tag]
    }

    #[test]
    fn test_in_order_delivery() {
        let mut seq = PeerSequencer::default();
        let peer = Uuid::new_v4();
        assert_eq!(seq.admit(peer, 1, u(1)), Admission::Deliver(vec![u(1)]));
        assert_eq!(seq.admit(peer, 2, u(2)), Admission::Deliver(vec![u(2)]));
        assert_eq!(seq.expected(&peer), Some(3));
    }

    #[test]
    fn test_gap_is_held_then_released() {
        let mut seq = PeerSequencer::default();
        let peer = Uuid::new_v4();
        seq.seed(peer, 1);

        assert_eq!(seq.admit(peer, 3, u(3)), Admission::Held);
        assert_eq!(seq.admit(peer, 2, u(2)), Admission::Held);
        assert_eq!(seq.held(&peer), 2);
        assert_eq!(
            seq.admit(peer, 1, u(1)),
            Admission::Deliver(vec![u(1), u(2), u(3)])
        );
        assert_eq!(seq.held(&peer), 0);
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut seq = PeerSequencer::default();
        let peer = Uuid::new_v4();
        seq.seed(peer, 1);
        seq.admit(peer, 1, u(1));
        assert_eq!(seq.admit(peer, 1, u(1)), Admission::Duplicate);

        seq.admit(peer, 3, u(3));
        assert_eq!(seq.admit(peer, 3, u(3)), Admission::Duplicate);
    }

    #[test]
    fn test_peers_are_independent() {
        let mut seq = PeerSequencer::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        seq.seed(a, 1);
        seq.seed(b, 1);
        assert_eq!(seq.admit(a, 2, u(2)), Admission::Held);
        assert_eq!(seq.admit(b, 1, u(9)), Admission::Deliver(vec![u(9)]));
    }

    #[test]
    fn test_unsequenced_always_delivered() {
        let mut seq = PeerSequencer::default();
        let peer = Uuid::new_v4();
        assert_eq!(seq.admit(peer, 0, u(0)), Admission::Deliver(vec![u(0)]));
        assert_eq!(seq.admit(peer, 0, u(0)), Admission::Deliver(vec![u(0)]));
        assert_eq!(seq.expected(&peer), None);
    }

    #[test]
    fn test_overflow_requests_resync() {
        let mut seq = PeerSequencer::new(2);
        let peer = Uuid::new_v4();
        seq.seed(peer, 1);
        assert_eq!(seq.admit(peer, 2, u(2)), Admission::Held);
        assert_eq!(seq.admit(peer, 3, u(3)), Admission::Held);
        assert_eq!(seq.admit(peer, 4, u(4)), Admission::Overflow);
        assert_eq!(seq.expected(&peer), None);
    }

    #[test]
    fn test_watermarks_skip_synced_clocks() {
        let mut seq = PeerSequencer::default();
        let peer = Uuid::new_v4();
        seq.seed(peer, 1);
        seq.admit(peer, 4, u(4));
        seq.admit(peer, 6, u(6));

        let released = seq.apply_watermarks(&[Watermark { peer_id: peer, clock: 4 }]);
        assert!(released.is_empty());
        assert_eq!(seq.expected(&peer), Some(5));
        assert_eq!(seq.admit(peer, 5, u(5)), Admission::Deliver(vec![u(5), u(6)]));
    }

    #[test]
    fn test_seed_never_moves_backwards() {
        let mut seq = PeerSequencer::default();
        let peer = Uuid::new_v4();
        seq.seed(peer, 1);
        seq.admit(peer, 1, u(1));
        seq.admit(peer, 2, u(2));

        // Reconnected peer resends from its oldest unacknowledged delta.
        seq.seed(peer, 2);
        assert_eq!(seq.expected(&peer), Some(3));
        assert_eq!(seq.admit(peer, 2, u(2)), Admission::Duplicate);
    }

    #[test]
    fn test_forgotten_peer_takes_new_baseline() {
        let mut seq = PeerSequencer::default();
        let peer = Uuid::new_v4();
        seq.seed(peer, 1);
        seq.admit(peer, 1, u(1));
        seq.admit(peer, 2, u(2));
        assert_eq!(seq.admit(peer, 5, u(5)), Admission::Held);

        seq.forget(&peer);
        assert_eq!(seq.expected(&peer), None);
        assert_eq!(seq.held(&peer), 0);

        // A fresh session of the same peer counts from 1 again.
        seq.seed(peer, 1);
        assert_eq!(seq.admit(peer, 1, u(9)), Admission::Deliver(vec![u(9)]));
    }

    #[test]
    fn test_watermark_at_max_clock() {
        let mut seq = PeerSequencer::default();
        let peer = Uuid::new_v4();
        let released = seq.apply_watermarks(&[Watermark { peer_id: peer, clock: u64::MAX }]);
        assert!(released.is_empty());
        assert_eq!(seq.expected(&peer), Some(u64::MAX));
    }
}
