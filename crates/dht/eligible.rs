use std::collections::HashMap;

use tracing::debug;

use crate::id::Id;
use crate::peer::PeerInfo;
use crate::value::Value;

/// Filter for values coming back from a value lookup. At most one value
/// survives: the highest acceptable sequence number wins.
pub struct EligibleValue {
    target: Id,
    expected_sequence_number: i32,
    value: Option<Value>,
}

impl EligibleValue {
    pub fn new(target: Id, expected_sequence_number: i32) -> Self {
        Self {
            target,
            expected_sequence_number,
            value: None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn take(self) -> Option<Value> {
        self.value
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// Accepts `value` when it belongs to the target, satisfies the
    /// sequence floor and verifies. Returns false on rejection so the
    /// caller can discard the rest of the sender's response.
    pub fn update(&mut self, value: Value) -> bool {
        if value.id() != self.target {
            debug!(target = %self.target, "Dropping value with foreign id");
            return false;
        }
        if self.expected_sequence_number >= 0
            && value.sequence_number() < self.expected_sequence_number
        {
            debug!(
                sequence = value.sequence_number(),
                expected = self.expected_sequence_number,
                "Dropping stale value"
            );
            return false;
        }
        if !value.is_valid() {
            debug!(target = %self.target, "Dropping value with bad signature");
            return false;
        }
        match &self.value {
            Some(retained) if retained.sequence_number() >= value.sequence_number() => {}
            _ => self.value = Some(value),
        }
        true
    }
}

/// Filter and accumulator for peer records coming back from a peer
/// lookup, keyed by announcer so one peer reached through several nodes
/// keeps every distinct route.
pub struct EligiblePeers {
    target: Id,
    capacity: usize,
    peers: HashMap<(Id, u64), PeerInfo>,
}

impl EligiblePeers {
    pub fn new(target: Id, capacity: usize) -> Self {
        Self {
            target,
            capacity,
            peers: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Validates and merges a whole response worth of peers. The batch is
    /// atomic: one bad record condemns the sender, nothing is merged.
    pub fn add(&mut self, batch: Vec<PeerInfo>) -> bool {
        let mut validated = Vec::with_capacity(batch.len());
        for mut peer in batch {
            if *peer.peer_id() != self.target {
                debug!(target = %self.target, "Dropping peer batch with foreign id");
                return false;
            }
            if !peer.validate() {
                debug!(target = %self.target, "Dropping peer batch with bad signature");
                return false;
            }
            validated.push(peer);
        }
        for peer in validated {
            self.peers
                .insert((*peer.node_id(), peer.fingerprint()), peer);
        }
        true
    }

    /// Capacity is only enforced here, not on merge.
    pub fn prune(&mut self) {
        if self.peers.len() <= self.capacity {
            return;
        }
        let mut peers: Vec<PeerInfo> = self.peers.drain().map(|(_, peer)| peer).collect();
        peers.sort_by(|a, b| self.display_order(a, b));
        peers.truncate(self.capacity);
        for peer in peers {
            self.peers
                .insert((*peer.node_id(), peer.fingerprint()), peer);
        }
    }

    fn display_order(&self, a: &PeerInfo, b: &PeerInfo) -> std::cmp::Ordering {
        b.is_authenticated()
            .cmp(&a.is_authenticated())
            .then_with(|| self.target.three_way_compare(a.node_id(), b.node_id()))
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| self.display_order(a, b));
        peers
    }
}
