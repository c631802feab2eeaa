//! Insertion-ordered bounded cache.
//!
//! When an insert pushes the cache over capacity, the oldest
//! `capacity / 2 + 1` entries are dropped in one sweep. Reads do not
//! refresh an entry's position; re-inserting a key moves it to the back.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use crate::errors::CacheError;

/// A bounded map that evicts its oldest half on overflow.
#[derive(Debug)]
pub struct Cache<K, V> {
    capacity: usize,
    next_seq: u64,
    entries:  HashMap<K, (u64, V)>,
    order:    BTreeMap<u64, K>,
}

impl<K: Eq + Hash + Clone, V> Cache<K, V> {
    /// Create an empty cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        if capacity == 0 {
            return Err(CacheError::ZeroCapacity);
        }
        Ok(Self { capacity, next_seq: 0, entries: HashMap::new(), order: BTreeMap::new() })
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace `key`. The entry becomes the newest.
    pub fn put(&mut self, key: K, value: V) {
        if let Some((seq, _)) = self.entries.remove(&key) {
            self.order.remove(&seq);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.entries.insert(key, (seq, value));

        if self.entries.len() > self.capacity {
            self.evict(self.capacity / 2 + 1);
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (seq, value) = self.entries.remove(key)?;
        self.order.remove(&seq);
        Some(value)
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn capacity(&self) -> usize { self.capacity }

    fn evict(&mut self, count: usize) {
        for _ in 0..count {
            let Some((_, key)) = self.order.pop_first() else { break };
            self.entries.remove(&key);
        }
        tracing::trace!("[courier] cache evicted {count} entries, {} left", self.entries.len());
    }
}
