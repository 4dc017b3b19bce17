use std::time::Instant;

use crate::contact::Contact;
use crate::key::NodeId;

/// Outcome of `KBucket::add_contact`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AddOutcome {
    Inserted,
    MovedToFront,
    Full,
    Rejected,
}

/// A contiguous slice of the 512-bit id space holding up to `capacity`
/// recently seen contacts, MRU at the front. `range_max = None` denotes the
/// exclusive upper bound `2^(8*KEY_LENGTH)`; only the single root bucket of a
/// freshly constructed `RoutingTable` ever carries that value.
#[derive(Clone, Debug)]
pub struct KBucket {
    pub range_min: NodeId,
    pub range_max: Option<NodeId>,
    contacts: Vec<Contact>,
    capacity: usize,
    last_accessed: Instant,
}

impl KBucket {
    pub fn new(range_min: NodeId, range_max: Option<NodeId>, capacity: usize) -> Self {
        KBucket {
            range_min,
            range_max,
            contacts: Vec::new(),
            capacity,
            last_accessed: Instant::now(),
        }
    }

    pub fn key_in_range(&self, id: &NodeId) -> bool {
        *id >= self.range_min && self.range_max.as_ref().map_or(true, |max| id < max)
    }

    /// Upserts `c`. Node already present: moved to front, address fields
    /// overwritten (`MovedToFront`). Bucket not full: pushed to front
    /// (`Inserted`). Otherwise `Full`. `Rejected` guards the
    /// "contact belongs to this range" invariant.
    pub fn add_contact(&mut self, mut c: Contact) -> AddOutcome {
        if !self.key_in_range(&c.node_id) {
            return AddOutcome::Rejected;
        }
        if let Some(pos) = self.contacts.iter().position(|x| x.node_id == c.node_id) {
            self.contacts.remove(pos);
            c.touch();
            self.contacts.insert(0, c);
            return AddOutcome::MovedToFront;
        }
        if self.contacts.len() < self.capacity {
            self.contacts.insert(0, c);
            return AddOutcome::Inserted;
        }
        AddOutcome::Full
    }

    /// Force-inserts `c` at the front without capacity checks; used by the
    /// routing table's Force-K rule after it has evicted a victim.
    pub fn insert_unchecked(&mut self, c: Contact) {
        self.contacts.retain(|x| x.node_id != c.node_id);
        self.contacts.insert(0, c);
    }

    /// Removes `node_id`. If `force`, erases unconditionally. Otherwise
    /// increments `failed_rpc`; if that now exceeds `tolerance`, erases.
    /// Soft removal preserves the contact's position.
    pub fn remove_contact(&mut self, node_id: &NodeId, force: bool, tolerance: u32) -> bool {
        let pos = match self.contacts.iter().position(|c| &c.node_id == node_id) {
            Some(p) => p,
            None => return false,
        };
        if force {
            self.contacts.remove(pos);
            return true;
        }
        self.contacts[pos].failed_rpc += 1;
        if self.contacts[pos].failed_rpc > tolerance {
            self.contacts.remove(pos);
            return true;
        }
        false
    }

    pub fn get_contact(&self, node_id: &NodeId) -> Option<Contact> {
        self.contacts.iter().find(|c| &c.node_id == node_id).cloned()
    }

    /// Up to `n` contacts in MRU order, skipping any whose id is in `exclude`.
    pub fn get_contacts(&self, n: usize, exclude: &[NodeId]) -> Vec<Contact> {
        self.contacts
            .iter()
            .filter(|c| !exclude.contains(&c.node_id))
            .take(n)
            .cloned()
            .collect()
    }

    pub fn all_contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn size(&self) -> usize {
        self.contacts.len()
    }

    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    pub fn set_last_accessed(&mut self, t: Instant) {
        self.last_accessed = t;
    }

    /// The least-recently-seen contact (back of the list); used by the
    /// liveness ping before eviction.
    pub fn lru(&self) -> Option<Contact> {
        self.contacts.last().cloned()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Splits `self` at `midpoint`, draining contacts into the half they
    /// belong to. Returns `(lower, upper)`, both spanning half of `self`'s
    /// original range.
    pub fn split(mut self, midpoint: NodeId) -> (KBucket, KBucket) {
        let mut lower = KBucket::new(self.range_min, Some(midpoint), self.capacity);
        let mut upper = KBucket::new(midpoint, self.range_max, self.capacity);
        lower.last_accessed = self.last_accessed;
        upper.last_accessed = self.last_accessed;
        for c in self.contacts.drain(..) {
            if c.node_id < midpoint {
                lower.contacts.push(c);
            } else {
                upper.contacts.push(c);
            }
        }
        (lower, upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(capacity: usize) -> KBucket {
        KBucket::new(NodeId::min(), None, capacity)
    }

    #[test]
    fn test_insert_until_full() {
        let mut b = bucket(2);
        assert_eq!(b.add_contact(Contact::new(NodeId::rand(), "a", 1)), AddOutcome::Inserted);
        assert_eq!(b.add_contact(Contact::new(NodeId::rand(), "b", 1)), AddOutcome::Inserted);
        assert_eq!(b.add_contact(Contact::new(NodeId::rand(), "c", 1)), AddOutcome::Full);
        assert_eq!(b.size(), 2);
    }

    #[test]
    fn test_readd_moves_to_front_without_growing() {
        let mut b = bucket(3);
        let id = NodeId::rand();
        b.add_contact(Contact::new(id, "a", 1));
        b.add_contact(Contact::new(NodeId::rand(), "b", 1));
        assert_eq!(b.add_contact(Contact::new(id, "a-new", 2)), AddOutcome::MovedToFront);
        assert_eq!(b.size(), 2);
        assert_eq!(b.get_contact(&id).unwrap().host_ip, "a-new");
        assert_eq!(b.all_contacts()[0].node_id, id);
    }

    #[test]
    fn test_soft_remove_respects_tolerance() {
        let mut b = bucket(3);
        let id = NodeId::rand();
        b.add_contact(Contact::new(id, "a", 1));
        assert!(!b.remove_contact(&id, false, 1));
        assert_eq!(b.get_contact(&id).unwrap().failed_rpc, 1);
        assert!(b.remove_contact(&id, false, 1));
        assert!(b.get_contact(&id).is_none());
    }

    #[test]
    fn test_force_remove_ignores_tolerance() {
        let mut b = bucket(3);
        let id = NodeId::rand();
        b.add_contact(Contact::new(id, "a", 1));
        assert!(b.remove_contact(&id, true, 100));
        assert!(b.get_contact(&id).is_none());
    }
}
