use std::collections::BTreeMap;

use crate::candidates::CandidateNode;
use crate::id::Id;

/// The k best responders seen so far, ordered by distance from the target,
/// with the stability counters the termination rule reads.
pub struct ClosestSet {
    target: Id,
    capacity: usize,
    entries: BTreeMap<Id, CandidateNode>,
    insert_attempts_since_tail_modification: usize,
    insert_attempts_since_head_modification: usize,
}

impl ClosestSet {
    pub fn new(target: Id, capacity: usize) -> Self {
        Self {
            target,
            capacity,
            entries: BTreeMap::new(),
            insert_attempts_since_tail_modification: 0,
            insert_attempts_since_head_modification: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.entries.contains_key(&self.target.distance(id))
    }

    pub fn add(&mut self, candidate: CandidateNode) {
        let previous_head = self.entries.keys().next().copied();
        let previous_tail = self.entries.keys().next_back().copied();

        self.entries
            .insert(self.target.distance(candidate.id()), candidate);
        if self.entries.len() > self.capacity {
            self.entries.pop_last();
        }

        let head = self.entries.keys().next().copied();
        let tail = self.entries.keys().next_back().copied();
        if head == previous_head {
            self.insert_attempts_since_head_modification += 1;
        } else {
            self.insert_attempts_since_head_modification = 0;
        }
        if tail == previous_tail {
            self.insert_attempts_since_tail_modification += 1;
        } else {
            self.insert_attempts_since_tail_modification = 0;
        }
    }

    /// The set is at fixpoint once it is full and the far end has resisted
    /// more than `capacity` consecutive insert attempts.
    pub fn is_eligible(&self) -> bool {
        self.entries.len() >= self.capacity
            && self.insert_attempts_since_tail_modification > self.capacity
    }

    /// Nearest confirmed responder, maximal-distance sentinel when empty.
    pub fn head(&self) -> Id {
        self.entries
            .values()
            .next()
            .map(|cn| *cn.id())
            .unwrap_or_else(|| self.target.distance(&Id::MAX))
    }

    /// Farthest member, the "worst best responder" the termination rule
    /// compares against; maximal-distance sentinel when empty.
    pub fn tail(&self) -> Id {
        self.entries
            .values()
            .next_back()
            .map(|cn| *cn.id())
            .unwrap_or_else(|| self.target.distance(&Id::MAX))
    }

    pub fn insert_attempts_since_tail_modification(&self) -> usize {
        self.insert_attempts_since_tail_modification
    }

    pub fn insert_attempts_since_head_modification(&self) -> usize {
        self.insert_attempts_since_head_modification
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidateNode> {
        self.entries.values()
    }

    pub fn ids(&self) -> Vec<Id> {
        self.entries.values().map(|cn| *cn.id()).collect()
    }

    pub fn entries(&self) -> Vec<CandidateNode> {
        self.entries.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeInfo;

    fn candidate_at(n: u8) -> CandidateNode {
        let mut bytes = [0u8; 32];
        bytes[31] = n;
        CandidateNode::new(
            NodeInfo::new(Id::new(bytes), "127.0.0.1".parse().unwrap(), 1000 + n as u16),
            true,
        )
    }

    #[test]
    fn keeps_the_k_closest() {
        let mut set = ClosestSet::new(Id::MIN, 4);
        for n in (1..=8).rev() {
            set.add(candidate_at(n));
        }
        assert_eq!(set.len(), 4);
        let ids = set.ids();
        assert_eq!(ids, (1..=4).map(|n| *candidate_at(n).id()).collect::<Vec<_>>());
        assert_eq!(set.head(), *candidate_at(1).id());
        assert_eq!(set.tail(), *candidate_at(4).id());
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let mut set = ClosestSet::new(Id::MIN, 4);
        for n in 1..=32 {
            set.add(candidate_at(n));
            assert!(set.len() <= 4);
        }
    }

    #[test]
    fn stability_counters_track_the_frontier() {
        let mut set = ClosestSet::new(Id::MIN, 4);
        for n in 1..=4 {
            set.add(candidate_at(n));
        }
        // each add so far moved the tail
        assert_eq!(set.insert_attempts_since_tail_modification(), 0);

        // far nodes bounce off the full set, the tail stays
        for n in 10..=14 {
            set.add(candidate_at(n));
        }
        assert_eq!(set.insert_attempts_since_tail_modification(), 5);
        assert!(set.is_eligible());

        // a closer node evicts the tail and resets the counter
        set.add(candidate_at(2));
        // same id, same tail: this counts as an attempt
        assert_eq!(set.insert_attempts_since_tail_modification(), 6);

        let mut set = ClosestSet::new(Id::MIN, 2);
        set.add(candidate_at(5));
        set.add(candidate_at(6));
        set.add(candidate_at(7)); // bounces
        assert_eq!(set.insert_attempts_since_tail_modification(), 1);
        set.add(candidate_at(1)); // evicts 6, tail becomes 5
        assert_eq!(set.insert_attempts_since_tail_modification(), 0);
        assert_eq!(set.insert_attempts_since_head_modification(), 0);
    }

    #[test]
    fn not_eligible_until_full() {
        let mut set = ClosestSet::new(Id::MIN, 8);
        for n in 1..=3 {
            set.add(candidate_at(n));
        }
        for _ in 0..20 {
            set.add(candidate_at(3));
        }
        // plenty of stable attempts, but the set never filled
        assert!(!set.is_eligible());
    }
}
