use std::cell::RefCell;
use std::rc::Rc;

use crate::id::Id;
use crate::node::KBucketEntry;

/// Lazy query over a snapshot of routing-table entries: order by distance
/// from the target, apply the predicate, fill up to the requested count.
pub struct KClosestNodes {
    target: Id,
    count: usize,
    entries: Vec<KBucketEntry>,
    filter: Box<dyn Fn(&KBucketEntry) -> bool>,
}

impl KClosestNodes {
    pub fn new(target: Id, count: usize, entries: Vec<KBucketEntry>) -> Self {
        Self {
            target,
            count,
            entries,
            filter: Box::new(|_| true),
        }
    }

    pub fn filter(mut self, predicate: impl Fn(&KBucketEntry) -> bool + 'static) -> Self {
        self.filter = Box::new(predicate);
        self
    }

    pub fn fill(self) -> Vec<KBucketEntry> {
        let Self {
            target,
            count,
            mut entries,
            filter,
        } = self;
        entries.retain(|entry| filter(entry));
        entries.sort_by(|a, b| target.three_way_compare(a.id(), b.id()));
        entries.truncate(count);
        entries
    }
}

/// The routing-table collaborator as the lookup engine needs it. The
/// table's own maintenance (splits, ageing) happens elsewhere.
pub trait RoutingTable {
    fn closest_nodes(&self, target: &Id, count: usize) -> KClosestNodes;

    /// Drops the entry when it is bad, or unconditionally when `force` is
    /// set. Looked up by id so concurrent bucket churn cannot misdirect
    /// the removal.
    fn remove_if_bad(&mut self, id: &Id, force: bool);

    fn is_local_id(&self, id: &Id) -> bool;
}

pub type RoutingTableRef = Rc<RefCell<dyn RoutingTable>>;

/// Flat in-memory table, enough for tests and embedders that maintain
/// their entries externally.
pub struct MemoryRoutingTable {
    local_id: Id,
    entries: Vec<KBucketEntry>,
    removed: Vec<Id>,
}

impl MemoryRoutingTable {
    pub fn new(local_id: Id) -> Self {
        Self {
            local_id,
            entries: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn insert(&mut self, entry: KBucketEntry) {
        if entry.info().id != self.local_id {
            self.entries.push(entry);
        }
    }

    pub fn entries(&self) -> &[KBucketEntry] {
        &self.entries
    }

    /// Ids every `remove_if_bad` call was issued for, in call order.
    pub fn removed(&self) -> &[Id] {
        &self.removed
    }
}

impl RoutingTable for MemoryRoutingTable {
    fn closest_nodes(&self, target: &Id, count: usize) -> KClosestNodes {
        KClosestNodes::new(*target, count, self.entries.clone())
    }

    fn remove_if_bad(&mut self, id: &Id, force: bool) {
        self.removed.push(*id);
        if force {
            self.entries.retain(|entry| entry.id() != id);
        } else {
            self.entries
                .retain(|entry| entry.id() != id || entry.eligible_for_local_lookup());
        }
    }

    fn is_local_id(&self, id: &Id) -> bool {
        *id == self.local_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeInfo;

    fn entry_at(n: u8) -> KBucketEntry {
        let mut bytes = [0u8; 32];
        bytes[31] = n;
        KBucketEntry::reachable(NodeInfo::new(
            Id::new(bytes),
            "127.0.0.1".parse().unwrap(),
            1000 + n as u16,
        ))
    }

    #[test]
    fn fill_orders_and_truncates() {
        let entries: Vec<_> = [9, 3, 12, 1, 7].into_iter().map(entry_at).collect();
        let filled = KClosestNodes::new(Id::MIN, 3, entries).fill();
        let ids: Vec<_> = filled.iter().map(|e| *e.id()).collect();
        assert_eq!(ids, vec![*entry_at(1).id(), *entry_at(3).id(), *entry_at(7).id()]);
    }

    #[test]
    fn filter_applies_before_fill() {
        let entries: Vec<_> = (1..=6).map(entry_at).collect();
        let keep = *entry_at(4).id();
        let filled = KClosestNodes::new(Id::MIN, 8, entries)
            .filter(move |e| *e.id() == keep)
            .fill();
        assert_eq!(filled.len(), 1);
        assert_eq!(*filled[0].id(), keep);
    }

    #[test]
    fn memory_table_contract() {
        let local = Id::random();
        let mut table = MemoryRoutingTable::new(local);
        for n in 1..=4 {
            table.insert(entry_at(n));
        }
        assert!(table.is_local_id(&local));
        assert!(!table.is_local_id(entry_at(1).id()));

        let closest = table.closest_nodes(&Id::MIN, 2).fill();
        assert_eq!(closest.len(), 2);

        table.remove_if_bad(entry_at(2).id(), true);
        assert_eq!(table.removed(), &[*entry_at(2).id()]);
        assert_eq!(table.entries().len(), 3);
    }
}
