use std::collections::HashMap;
use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::crypto::hash_to_key;
use crate::key::NodeId;

/// Opaque collaborator consulted by the `FindValue` handler before the local
/// `DataStore`: if it `Has(key)`, the handler reports this node as an
/// alternative value holder instead of returning `DataStore`'s values
/// directly (e.g. backing a large-blob store kept outside the DHT proper).
/// The core ships no implementation; `None` is the default and the handler
/// falls straight through to `DataStore`.
pub trait AlternativeStore: Send + Sync {
    fn has(&self, key: &NodeId) -> bool;
}

/// A single stored value under some key, with its own TTL and refresh clock.
#[derive(Clone, Debug)]
struct StoredValue {
    value: Vec<u8>,
    ttl: Duration,
    stored_at: Instant,
    last_refresh: Instant,
    hashable: bool,
}

impl StoredValue {
    fn expire_time(&self) -> Instant {
        self.stored_at + self.ttl
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expire_time()
    }
}

/// In-memory key -> multi-value store with per-item TTL, last-refresh
/// timestamp, and a "hashable" flag restricting mutable multivalue semantics
/// when the key is the hash of its value.
///
/// Invariant: for hashable keys, cardinality <= 1; for non-hashable keys,
/// duplicate byte-identical values are deduplicated.
#[derive(Default)]
pub struct DataStore {
    items: HashMap<NodeId, Vec<StoredValue>>,
}

/// An entry due for republication, as returned by `values_to_refresh`.
pub struct RefreshEntry {
    pub key: NodeId,
    pub value: Vec<u8>,
    pub ttl: Duration,
}

impl DataStore {
    pub fn new() -> Self {
        DataStore {
            items: HashMap::new(),
        }
    }

    fn remove_expired_at(&mut self, key: &NodeId, now: Instant) {
        if let Some(values) = self.items.get_mut(key) {
            values.retain(|v| !v.is_expired(now));
            if values.is_empty() {
                self.items.remove(key);
            }
        }
    }

    fn is_hashable_key(key: &NodeId, value: &[u8]) -> bool {
        hash_to_key(value) == *key
    }

    /// Stores `value` under `key`. If the key is hashable (hash(value) ==
    /// key) and has no prior entry, stores as the sole hashable value; a
    /// later store under a hashable key with a different value fails. A
    /// non-hashable key appends the value, deduplicated by bytes.
    pub fn store(&mut self, key: NodeId, value: Vec<u8>, ttl: Duration) -> bool {
        let now = Instant::now();
        self.remove_expired_at(&key, now);
        let hashable = Self::is_hashable_key(&key, &value);

        let values = self.items.entry(key).or_insert_with(Vec::new);

        if hashable {
            if let Some(existing) = values.first() {
                return existing.value == value;
            }
            values.push(StoredValue {
                value,
                ttl,
                stored_at: now,
                last_refresh: now,
                hashable: true,
            });
            return true;
        }

        if let Some(existing) = values.iter_mut().find(|v| v.value == value) {
            existing.ttl = ttl;
            existing.stored_at = now;
            existing.last_refresh = now;
        } else {
            values.push(StoredValue {
                value,
                ttl,
                stored_at: now,
                last_refresh: now,
                hashable: false,
            });
        }
        true
    }

    /// Updates `last_refresh` of an existing `(key, value)` pair. Returns
    /// `false` if the pair is absent so the caller can fall back to `store`.
    pub fn refresh(&mut self, key: &NodeId, value: &[u8]) -> bool {
        let now = Instant::now();
        self.remove_expired_at(key, now);
        if let Some(values) = self.items.get_mut(key) {
            if let Some(existing) = values.iter_mut().find(|v| v.value == value) {
                existing.last_refresh = now;
                return true;
            }
        }
        false
    }

    /// Returns every stored value under `key` (possibly empty). Does not
    /// alter timestamps.
    pub fn load(&mut self, key: &NodeId) -> Vec<Vec<u8>> {
        self.remove_expired_at(key, Instant::now());
        self.items
            .get(key)
            .map(|values| values.iter().map(|v| v.value.clone()).collect())
            .unwrap_or_default()
    }

    pub fn time_to_live(&self, key: &NodeId, value: &[u8]) -> Option<Duration> {
        self.find(key, value).map(|v| v.ttl)
    }

    pub fn last_refresh_time(&self, key: &NodeId, value: &[u8]) -> Option<Instant> {
        self.find(key, value).map(|v| v.last_refresh)
    }

    pub fn expire_time(&self, key: &NodeId, value: &[u8]) -> Option<Instant> {
        self.find(key, value).map(|v| v.expire_time())
    }

    fn find(&self, key: &NodeId, value: &[u8]) -> Option<&StoredValue> {
        self.items
            .get(key)
            .and_then(|values| values.iter().find(|v| v.value == value))
    }

    /// Returns every `(key, value, ttl)` whose `last_refresh` is older than
    /// `interval`.
    pub fn values_to_refresh(&self, interval: Duration) -> Vec<RefreshEntry> {
        let now = Instant::now();
        let mut ret = Vec::new();
        for (key, values) in &self.items {
            for v in values {
                if now.saturating_duration_since(v.last_refresh) > interval {
                    ret.push(RefreshEntry {
                        key: *key,
                        value: v.value.clone(),
                        ttl: v.ttl,
                    });
                }
            }
        }
        ret
    }

    /// Removes all expired items; intended to be driven by a caller-owned
    /// reaper loop, not run implicitly on every read.
    pub fn reap_expired(&mut self) {
        let now = Instant::now();
        let keys: Vec<NodeId> = self.items.keys().copied().collect();
        for key in keys {
            self.remove_expired_at(&key, now);
        }
    }

    pub fn keys(&self) -> HashSet<NodeId> {
        self.items.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_to_key;
    use std::thread::sleep;

    #[test]
    fn test_store_then_load_roundtrip() {
        let mut store = DataStore::new();
        let key = NodeId::rand();
        store.store(key, b"hello".to_vec(), Duration::from_secs(60));
        assert_eq!(store.load(&key), vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_refresh_without_prior_store_fails() {
        let mut store = DataStore::new();
        let key = NodeId::rand();
        assert!(!store.refresh(&key, b"hello"));
    }

    #[test]
    fn test_refresh_advances_last_refresh_without_changing_value() {
        let mut store = DataStore::new();
        let key = NodeId::rand();
        store.store(key, b"hello".to_vec(), Duration::from_secs(60));
        let t0 = store.last_refresh_time(&key, b"hello").unwrap();
        sleep(Duration::from_millis(5));
        assert!(store.refresh(&key, b"hello"));
        let t1 = store.last_refresh_time(&key, b"hello").unwrap();
        assert!(t1 > t0);
        assert_eq!(store.load(&key), vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_hashable_key_single_value() {
        let value = b"immutable payload".to_vec();
        let key = hash_to_key(&value);
        let mut store = DataStore::new();
        assert!(store.store(key, value.clone(), Duration::from_secs(60)));
        // A second store under the same hashable key with different bytes
        // must fail rather than create a second value.
        assert!(!store.store(key, b"different".to_vec(), Duration::from_secs(60)));
        assert_eq!(store.load(&key), vec![value]);
    }

    #[test]
    fn test_non_hashable_key_deduplicates() {
        let mut store = DataStore::new();
        let key = NodeId::rand();
        store.store(key, b"a".to_vec(), Duration::from_secs(60));
        store.store(key, b"a".to_vec(), Duration::from_secs(60));
        store.store(key, b"b".to_vec(), Duration::from_secs(60));
        let mut values = store.load(&key);
        values.sort();
        assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_expired_value_is_absent_on_read() {
        let mut store = DataStore::new();
        let key = NodeId::rand();
        store.store(key, b"short-lived".to_vec(), Duration::from_millis(5));
        sleep(Duration::from_millis(15));
        assert!(store.load(&key).is_empty());
    }

    #[test]
    fn test_values_to_refresh_picks_up_stale_entries() {
        let mut store = DataStore::new();
        let key = NodeId::rand();
        store.store(key, b"hello".to_vec(), Duration::from_secs(60));
        sleep(Duration::from_millis(15));
        let due = store.values_to_refresh(Duration::from_millis(5));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, key);
        assert_eq!(due[0].value, b"hello".to_vec());
    }
}
