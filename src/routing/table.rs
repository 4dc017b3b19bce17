use std::time::{Duration, Instant};

use rand::Rng;

use crate::contact::Contact;
use crate::key::NodeId;
use crate::routing::kbucket::{AddOutcome, KBucket};
use crate::KEY_LENGTH;

/// Outcome of `RoutingTable::add_contact`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TableAddOutcome {
    Inserted,
    MovedToFront,
    /// Force-K admitted the new contact, evicting the named victim.
    ForceKEvicted(NodeId),
    Rejected,
}

/// The arithmetic midpoint of `[min, max)`, i.e. `(min + max) / 2` computed
/// as an unsigned big-endian integer without overflow. `max = None` denotes
/// `2^(8*KEY_LENGTH)`, which only ever occurs for the single root bucket
/// (whose `range_min` is always zero).
fn midpoint(min: &NodeId, max: Option<&NodeId>) -> NodeId {
    let max = match max {
        Some(m) => *m,
        None => {
            let mut top = [0u8; KEY_LENGTH];
            top[0] = 0x80;
            return NodeId::new(top);
        }
    };
    let mut sum = [0u8; KEY_LENGTH + 1];
    let mut carry: u16 = 0;
    for i in (0..KEY_LENGTH).rev() {
        let s = min.0[i] as u16 + max.0[i] as u16 + carry;
        sum[i + 1] = (s & 0xFF) as u8;
        carry = s >> 8;
    }
    sum[0] = carry as u8;

    // divide the 65-byte sum by 2 (shift right one bit)
    let mut out = [0u8; KEY_LENGTH];
    let mut carry_bit = 0u8;
    for i in 0..=KEY_LENGTH {
        let cur = sum[i];
        let shifted = (cur >> 1) | (carry_bit << 7);
        carry_bit = cur & 1;
        if i > 0 {
            out[i - 1] = shifted;
        }
    }
    NodeId::new(out)
}

/// A node's routing table: a contiguous, non-overlapping partition of the
/// full id space into `KBucket`s, grown by lazily splitting the bucket that
/// contains `holder_id`.
pub struct RoutingTable {
    holder_id: NodeId,
    buckets: Vec<KBucket>,
    capacity: usize,
    failed_rpc_tolerance: u32,
    /// An id known to lie inside the brother bucket as of the most recent
    /// split of the holder's bucket. The brother bucket's range never
    /// subdivides again (only the holder's side keeps splitting), so this
    /// marker always resolves to the correct bucket via `bucket_index_of`,
    /// regardless of which side of the id space the holder keeps
    /// descending into.
    brother_marker: Option<NodeId>,
}

impl RoutingTable {
    pub fn new(holder_id: NodeId, capacity: usize, failed_rpc_tolerance: u32) -> Self {
        RoutingTable {
            holder_id,
            buckets: vec![KBucket::new(NodeId::min(), None, capacity)],
            capacity,
            failed_rpc_tolerance,
            brother_marker: None,
        }
    }

    fn bucket_index_of(&self, id: &NodeId) -> usize {
        self.buckets
            .iter()
            .position(|b| b.key_in_range(id))
            .expect("buckets must tile the full id space")
    }

    pub fn bucket_of_holder(&self) -> usize {
        self.bucket_index_of(&self.holder_id)
    }

    /// The bucket index covering `id`; used by the admission worker to find
    /// the LRU occupant of the bucket that just refused a new contact.
    pub fn bucket_index_for(&self, id: &NodeId) -> usize {
        self.bucket_index_of(id)
    }

    /// The sibling of the bucket containing `holder_id` after the most
    /// recent split. `None` only when the table is still a single root
    /// bucket.
    pub fn brother_bucket_of_holder(&self) -> Option<usize> {
        self.brother_marker.map(|m| self.bucket_index_of(&m))
    }

    /// Upserts `c` into the bucket covering its id, splitting, applying
    /// Force-K, or rejecting per §4.3.
    pub fn add_contact(&mut self, c: Contact) -> TableAddOutcome {
        loop {
            let idx = self.bucket_index_of(&c.node_id);
            match self.buckets[idx].add_contact(c.clone()) {
                AddOutcome::Inserted => return TableAddOutcome::Inserted,
                AddOutcome::MovedToFront => return TableAddOutcome::MovedToFront,
                AddOutcome::Rejected => return TableAddOutcome::Rejected,
                AddOutcome::Full => {
                    if self.buckets[idx].key_in_range(&self.holder_id) {
                        self.split_bucket(idx);
                        continue;
                    }
                    if self.brother_bucket_of_holder() == Some(idx) {
                        return self.try_force_k(idx, c);
                    }
                    return TableAddOutcome::Rejected;
                },
            }
        }
    }

    fn split_bucket(&mut self, idx: usize) {
        let bucket = self.buckets.remove(idx);
        let mid = midpoint(&bucket.range_min, bucket.range_max.as_ref());
        let (lower, upper) = bucket.split(mid);
        let holder_in_lower = lower.key_in_range(&self.holder_id);
        self.brother_marker = Some(if holder_in_lower {
            upper.range_min
        } else {
            lower.range_min
        });
        self.buckets.insert(idx, upper);
        self.buckets.insert(idx, lower);
    }

    /// §4.3.1 Force-K rule: protects the node's k closest neighbours from a
    /// churny brother bucket while still admitting genuinely closer peers.
    fn try_force_k(&mut self, brother_idx: usize, candidate: Contact) -> TableAddOutcome {
        let home_idx = self.bucket_of_holder();
        let v = self.capacity.saturating_sub(self.buckets[home_idx].size());
        if v == 0 {
            return TableAddOutcome::Rejected;
        }

        let mut by_distance: Vec<Contact> = self.buckets[brother_idx].all_contacts().to_vec();
        by_distance.sort_by_key(|c| self.holder_id.xor(&c.node_id));

        if v > by_distance.len() {
            return TableAddOutcome::Rejected;
        }
        let threshold_distance = self.holder_id.xor(&by_distance[v - 1].node_id);
        let candidate_distance = self.holder_id.xor(&candidate.node_id);
        if candidate_distance >= threshold_distance {
            return TableAddOutcome::Rejected;
        }

        // The top v-1 closest contacts (ranks 1..v-1) are protected from
        // eviction; only the remainder (rank v and farther) is eligible.
        let remainder = &by_distance[v - 1..];

        // Least useful: ascending-distance rank + descending-last-seen rank,
        // both computed within the remainder; ties broken deterministically
        // by ascending node_id.
        let mut by_recency: Vec<Contact> = remainder.to_vec();
        by_recency.sort_by_key(|c| std::cmp::Reverse(c.last_seen));

        let scored: Vec<(usize, NodeId)> = remainder
            .iter()
            .enumerate()
            .map(|(dist_rank, c)| {
                let recency_rank = by_recency.iter().position(|x| x.node_id == c.node_id).unwrap();
                (dist_rank + recency_rank, c.node_id)
            })
            .collect();
        let victim_id = scored
            .into_iter()
            .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
            .map(|(_, id)| id);

        let victim_id = match victim_id {
            Some(id) => id,
            None => return TableAddOutcome::Rejected,
        };

        self.buckets[brother_idx].remove_contact(&victim_id, true, self.failed_rpc_tolerance);
        self.buckets[brother_idx].insert_unchecked(candidate);
        TableAddOutcome::ForceKEvicted(victim_id)
    }

    /// Removes `node_id` from whichever bucket holds it; `force` bypasses
    /// the failed-rpc tolerance.
    pub fn remove_contact(&mut self, node_id: &NodeId, force: bool) -> bool {
        let idx = self.bucket_index_of(node_id);
        self.buckets[idx].remove_contact(node_id, force, self.failed_rpc_tolerance)
    }

    pub fn get_contact(&self, node_id: &NodeId) -> Option<Contact> {
        let idx = self.bucket_index_of(node_id);
        self.buckets[idx].get_contact(node_id)
    }

    /// Locates the bucket covering `key`, fills from it (MRU order,
    /// skipping `exclude`); if short, walks the remaining buckets in
    /// ascending XOR-distance-of-bucket order, re-sorting each batch by
    /// distance to `key`.
    pub fn find_close_nodes(&self, key: &NodeId, count: usize, exclude: &[NodeId]) -> Vec<Contact> {
        let home = self.bucket_index_of(key);
        let mut ret: Vec<Contact> = self.buckets[home].get_contacts(count, exclude);

        if ret.len() < count {
            let mut others: Vec<usize> = (0..self.buckets.len()).filter(|&i| i != home).collect();
            others.sort_by_key(|&i| {
                let bucket_repr = self.buckets[i].range_min;
                bucket_repr.xor(key)
            });
            for i in others {
                if ret.len() >= count {
                    break;
                }
                let mut batch = self.buckets[i].get_contacts(count, exclude);
                ret.append(&mut batch);
                ret.sort_by_key(|c| c.node_id.xor(key));
            }
        }

        ret.sort_by_key(|c| c.node_id.xor(key));
        ret.truncate(count);
        ret
    }

    /// For each bucket from `start_index` whose `last_accessed` is older
    /// than `interval` (or `force`), yields a random id drawn from that
    /// bucket's range.
    pub fn get_refresh_list(&self, start_index: usize, interval: Duration, force: bool) -> Vec<NodeId> {
        let now = Instant::now();
        let mut ret = Vec::new();
        for bucket in self.buckets.iter().skip(start_index) {
            if force || now.saturating_duration_since(bucket.last_accessed()) > interval {
                ret.push(Self::rand_in_bucket(bucket));
            }
        }
        ret
    }

    fn rand_in_bucket(bucket: &KBucket) -> NodeId {
        let mut rng = rand::thread_rng();
        let mut bytes = bucket.range_min.0;
        // randomize every bit below the fixed high prefix shared by min/max,
        // then clamp back into [min, max).
        for byte in bytes.iter_mut() {
            *byte = rng.gen();
        }
        let mut candidate = NodeId::new(bytes);
        if candidate < bucket.range_min {
            candidate = bucket.range_min;
        }
        if let Some(max) = bucket.range_max {
            if candidate >= max {
                candidate = bucket.range_min;
            }
        }
        candidate
    }

    pub fn touch_kbucket(&mut self, any_id_in_bucket: &NodeId) {
        let idx = self.bucket_index_of(any_id_in_bucket);
        self.buckets[idx].set_last_accessed(Instant::now());
    }

    /// The LRU contact of `bucket_index` — used by the liveness ping before
    /// eviction on bucket-full.
    pub fn get_last_seen(&self, bucket_index: usize) -> Option<Contact> {
        self.buckets.get(bucket_index).and_then(|b| b.lru())
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_size(&self, index: usize) -> usize {
        self.buckets[index].size()
    }

    /// Every contact across every bucket; used for persisting a bootstrap
    /// snapshot and for picking a random third peer during NAT detection.
    pub fn all_contacts(&self) -> Vec<Contact> {
        self.buckets.iter().flat_map(|b| b.all_contacts().iter().cloned()).collect()
    }

    pub fn holder_id(&self) -> NodeId {
        self.holder_id
    }

    /// Asserts the tiling invariant used by tests: buckets cover
    /// `[0, 2^512)` contiguously with no overlap.
    #[cfg(test)]
    fn assert_tiles_id_space(&self) {
        assert_eq!(self.buckets[0].range_min, NodeId::min());
        for i in 0..self.buckets.len() - 1 {
            assert_eq!(self.buckets[i].range_max, Some(self.buckets[i + 1].range_min));
        }
        assert!(self.buckets.last().unwrap().range_max.is_none());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_table(capacity: usize) -> (NodeId, RoutingTable) {
        let holder = NodeId::rand();
        (holder, RoutingTable::new(holder, capacity, 0))
    }

    #[test]
    fn test_single_bucket_covers_whole_space() {
        let (_, table) = new_table(2);
        assert_eq!(table.size(), 1);
        table.assert_tiles_id_space();
    }

    #[test]
    fn test_split_grows_bucket_count_and_tiles_space() {
        let (holder, mut table) = new_table(2);
        // two contacts sharing the holder's bucket plus a third forces a split,
        // since the bucket containing holder_id is the only one that can split.
        for _ in 0..4 {
            let id = NodeId::rand();
            table.add_contact(Contact::new(id, "x", 1));
        }
        table.assert_tiles_id_space();
    }

    #[test]
    fn test_add_then_get_contact() {
        let (_, mut table) = new_table(4);
        let id = NodeId::rand();
        let c = Contact::new(id, "1.2.3.4", 9000);
        assert_eq!(table.add_contact(c.clone()), TableAddOutcome::Inserted);
        assert_eq!(table.get_contact(&id).unwrap().node_id, id);
    }

    #[test]
    fn test_readd_same_contact_does_not_grow_bucket() {
        let (_, mut table) = new_table(4);
        let id = NodeId::rand();
        table.add_contact(Contact::new(id, "1.2.3.4", 9000));
        table.add_contact(Contact::new(id, "1.2.3.4", 9001));
        assert_eq!(table.bucket_size(table.bucket_index_of(&id)), 1);
    }

    #[test]
    fn test_force_k_evicts_farther_contact_for_closer_one() {
        // Build a 2-bucket table (one split) so there is a genuine brother
        // bucket, then fill the brother bucket to capacity with far
        // contacts, and confirm a closer candidate evicts one of them while
        // a farther candidate is rejected outright.
        let holder = NodeId::new([0u8; KEY_LENGTH]);
        let mut table = RoutingTable::new(holder, 2, 0);

        // Force a split: fill the root (== holder's) bucket past capacity
        // with ids that also land in holder's bucket after the split, so
        // the routing table grows to two buckets with a real brother.
        // Ids with a leading 1 bit land in the upper half (holder's
        // complement), ids with leading 0 stay with holder.
        let mut far_ids = Vec::new();
        for i in 0u8..3 {
            let mut bytes = [0u8; KEY_LENGTH];
            bytes[0] = 0x80;
            bytes[KEY_LENGTH - 1] = i + 1;
            far_ids.push(NodeId::new(bytes));
        }
        for id in &far_ids {
            table.add_contact(Contact::new(*id, "far", 1));
        }
        assert_eq!(table.size(), 2);

        let brother = table.brother_bucket_of_holder().unwrap();
        assert_eq!(table.bucket_size(brother), 2);

        // A candidate closer to holder (smaller last byte, still in the
        // brother's range) than the farthest of the two current occupants
        // should evict one of them.
        let mut closer_bytes = [0u8; KEY_LENGTH];
        closer_bytes[0] = 0x80;
        closer_bytes[KEY_LENGTH - 1] = 0; // distance 0x80_00..00, closer than both occupants
        let closer = Contact::new(NodeId::new(closer_bytes), "closer", 1);
        match table.add_contact(closer.clone()) {
            TableAddOutcome::ForceKEvicted(_) => {},
            other => panic!("expected ForceKEvicted, got {:?}", other),
        }
        assert_eq!(table.bucket_size(brother), 2);
        assert!(table.get_contact(&closer.node_id).is_some());
    }

    #[test]
    fn test_force_k_never_evicts_protected_closest_contact() {
        // Brother bucket at capacity 3, home bucket empty, so v = 3 and
        // only the single farthest occupant (rank v..) is eviction-eligible;
        // the two closest (ranks 0,1) are protected even when their
        // last_seen is the oldest of the three.
        let holder = NodeId::new([0u8; KEY_LENGTH]);
        let mut table = RoutingTable::new(holder, 3, 0);

        let mut far_ids = Vec::new();
        for i in 0u8..4 {
            let mut bytes = [0u8; KEY_LENGTH];
            bytes[0] = 0x80;
            bytes[KEY_LENGTH - 1] = i + 1;
            far_ids.push(NodeId::new(bytes));
        }
        // far_ids[0] is closest (byte 1), far_ids[2] is farthest of the
        // three that end up occupying the bucket (byte 3); far_ids[3]
        // (byte 4) overflows and is rejected outright as farther than all.
        let mut closest = Contact::new(far_ids[0], "closest", 1);
        closest.last_seen = Instant::now() - Duration::from_secs(3600);
        let mut middle = Contact::new(far_ids[1], "middle", 1);
        middle.last_seen = Instant::now() - Duration::from_secs(60);
        let farthest = Contact::new(far_ids[2], "farthest", 1);

        table.add_contact(closest.clone());
        table.add_contact(middle.clone());
        table.add_contact(farthest.clone());
        table.add_contact(Contact::new(far_ids[3], "overflow", 1));
        assert_eq!(table.size(), 2);

        let brother = table.brother_bucket_of_holder().unwrap();
        assert_eq!(table.bucket_size(brother), 3);

        let mut closer_bytes = [0u8; KEY_LENGTH];
        closer_bytes[0] = 0x80;
        closer_bytes[KEY_LENGTH - 1] = 0;
        let closer = Contact::new(NodeId::new(closer_bytes), "closer", 1);
        match table.add_contact(closer.clone()) {
            TableAddOutcome::ForceKEvicted(evicted) => {
                assert_eq!(evicted, farthest.node_id);
            },
            other => panic!("expected ForceKEvicted, got {:?}", other),
        }
        assert!(table.get_contact(&closest.node_id).is_some());
        assert!(table.get_contact(&middle.node_id).is_some());
        assert!(table.get_contact(&farthest.node_id).is_none());
        assert!(table.get_contact(&closer.node_id).is_some());
    }
}
