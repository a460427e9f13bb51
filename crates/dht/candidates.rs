use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use crate::id::Id;
use crate::node::{KBucketEntry, NodeInfo};

/// A candidate becomes unreachable after this many unanswered sends.
pub const CANDIDATE_MAX_PINGS: u32 = 3;

/// Lookup-local state for one node the iteration has learned about.
#[derive(Debug, Clone)]
pub struct CandidateNode {
    info: NodeInfo,
    last_sent: Option<Instant>,
    last_reply: Option<Instant>,
    pinged: u32,
    token: u32,
    reachable: bool,
}

impl CandidateNode {
    pub fn new(info: NodeInfo, reachable: bool) -> Self {
        Self {
            info,
            last_sent: None,
            last_reply: None,
            pinged: 0,
            token: 0,
            reachable,
        }
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn id(&self) -> &Id {
        &self.info.id
    }

    pub fn is_sent(&self) -> bool {
        self.last_sent.is_some()
    }

    /// Marks the candidate in-flight; each send costs one ping.
    pub fn set_sent(&mut self) {
        self.pinged += 1;
        self.last_sent = Some(Instant::now());
    }

    /// Re-arms the candidate after a timeout so it can be retried.
    pub fn clear_sent(&mut self) {
        self.last_sent = None;
    }

    pub fn set_replied(&mut self) {
        self.last_reply = Some(Instant::now());
        self.last_sent = None;
        self.reachable = true;
    }

    pub fn has_replied(&self) -> bool {
        self.last_reply.is_some()
    }

    pub fn pinged(&self) -> u32 {
        self.pinged
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn set_token(&mut self, token: u32) {
        self.token = token;
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn is_unreachable(&self) -> bool {
        self.pinged >= CANDIDATE_MAX_PINGS
    }

    pub fn is_eligible(&self) -> bool {
        !self.is_sent() && !self.is_unreachable()
    }
}

/// The bounded frontier of nodes a lookup has yet to query, ordered by
/// distance from the target. Ids and network locations that ever entered
/// stay in the dedup sets, so nodes a peer re-advertises cannot re-enter
/// after being processed.
pub struct ClosestCandidates {
    target: Id,
    capacity: usize,
    dev_mode: bool,
    entries: BTreeMap<Id, CandidateNode>,
    known_ids: HashSet<Id>,
    known_locations: HashSet<SocketAddr>,
}

impl ClosestCandidates {
    pub fn new(target: Id, capacity: usize, dev_mode: bool) -> Self {
        Self {
            target,
            capacity,
            dev_mode,
            entries: BTreeMap::new(),
            known_ids: HashSet::new(),
            known_locations: HashSet::new(),
        }
    }

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// In production whole hosts are deduplicated; in developer mode many
    /// nodes share one address and only exact endpoints collide.
    fn location_key(&self, addr: &SocketAddr) -> SocketAddr {
        if self.dev_mode {
            *addr
        } else {
            SocketAddr::new(addr.ip(), 0)
        }
    }

    fn distance_key(&self, id: &Id) -> Id {
        self.target.distance(id)
    }

    pub fn add(&mut self, nodes: impl IntoIterator<Item = NodeInfo>) {
        for node in nodes {
            self.insert(node, false);
        }
        self.prune();
    }

    pub fn add_entries(&mut self, entries: impl IntoIterator<Item = KBucketEntry>) {
        for entry in entries {
            let reachable = entry.is_reachable();
            self.insert(entry.info().clone(), reachable);
        }
        self.prune();
    }

    fn insert(&mut self, node: NodeInfo, reachable: bool) {
        let location = self.location_key(&node.addr);
        if self.known_ids.contains(&node.id) || self.known_locations.contains(&location) {
            return;
        }
        self.known_ids.insert(node.id);
        self.known_locations.insert(location);
        self.entries
            .insert(self.distance_key(&node.id), CandidateNode::new(node, reachable));
    }

    /// Drops the farthest prunable candidates once over capacity. In-flight
    /// candidates are kept regardless, their call bookkeeping must finish.
    fn prune(&mut self) {
        while self.entries.len() > self.capacity {
            let victim = self
                .entries
                .iter()
                .rev()
                .find(|(_, cn)| !cn.is_sent())
                .map(|(distance, _)| *distance);
            match victim {
                Some(distance) => {
                    self.entries.remove(&distance);
                }
                None => break,
            }
        }
    }

    /// The best eligible candidate to query next: nearest first, fewer
    /// pings breaking ties.
    pub fn next(&self) -> Option<Id> {
        self.entries
            .values()
            .filter(|cn| cn.is_eligible())
            .min_by_key(|cn| (self.distance_key(cn.id()), cn.pinged()))
            .map(|cn| *cn.id())
    }

    pub fn get(&self, id: &Id) -> Option<&CandidateNode> {
        self.entries.get(&self.distance_key(id))
    }

    pub fn get_mut(&mut self, id: &Id) -> Option<&mut CandidateNode> {
        let key = self.distance_key(id);
        self.entries.get_mut(&key)
    }

    /// Removes the candidate but keeps its dedup footprint.
    pub fn remove(&mut self, id: &Id) -> Option<CandidateNode> {
        let key = self.distance_key(id);
        self.entries.remove(&key)
    }

    /// Removes every candidate matching the predicate; dedup footprints
    /// stay behind as with [`remove`].
    ///
    /// [`remove`]: ClosestCandidates::remove
    pub fn remove_if(&mut self, mut predicate: impl FnMut(&CandidateNode) -> bool) {
        self.entries.retain(|_, candidate| !predicate(candidate));
    }

    /// Nearest queued candidate, or the maximal-distance sentinel when the
    /// queue is empty.
    pub fn head(&self) -> Id {
        self.entries
            .values()
            .next()
            .map(|cn| *cn.id())
            .unwrap_or_else(|| self.target.distance(&Id::MAX))
    }

    /// Farthest queued candidate, same sentinel when empty.
    pub fn tail(&self) -> Id {
        self.entries
            .values()
            .next_back()
            .map(|cn| *cn.id())
            .unwrap_or_else(|| self.target.distance(&Id::MAX))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidateNode> {
        self.entries.values()
    }
}
