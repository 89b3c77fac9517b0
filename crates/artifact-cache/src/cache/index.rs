use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::entry::Entry;
use crate::key::CacheKey;

#[derive(Debug)]
struct Slot {
    seq: u64,
    entry: Arc<Entry>,
}

/// Maps keys to entries and keeps them in insertion order.
///
/// The index has no synchronization of its own, it lives behind the cache's global lock.
/// `order` is keyed by a monotonically increasing sequence number, so its first element is
/// always the oldest insertion.
#[derive(Debug)]
pub(crate) struct Index {
    by_key: HashMap<CacheKey, Slot>,
    order: BTreeMap<u64, Arc<Entry>>,
    current_size: u64,
    capacity: u64,
    next_seq: u64,
}

impl Index {
    pub fn new(capacity: u64) -> Self {
        Self {
            by_key: HashMap::new(),
            order: BTreeMap::new(),
            current_size: 0,
            capacity,
            next_seq: 0,
        }
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Whether `additional` more bytes can be admitted without exceeding the capacity.
    pub fn fits(&self, additional: u64) -> bool {
        self.current_size
            .checked_add(additional)
            .is_some_and(|total| total <= self.capacity)
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<&Arc<Entry>> {
        self.by_key.get(key).map(|slot| &slot.entry)
    }

    /// Publishes `entry` at the tail of the insertion order.
    ///
    /// The key must not be present yet.
    pub fn insert(&mut self, entry: Arc<Entry>) {
        debug_assert!(!self.by_key.contains_key(entry.key()));

        let seq = self.next_seq();
        self.current_size += entry.size();
        self.order.insert(seq, entry.clone());
        if let Some(previous) = self
            .by_key
            .insert(entry.key().clone(), Slot { seq, entry })
        {
            // keep both maps consistent even if the precondition was violated
            self.order.remove(&previous.seq);
            self.current_size -= previous.entry.size();
        }
    }

    /// The oldest entry, which is the next eviction victim.
    pub fn head(&self) -> Option<&Arc<Entry>> {
        self.order.first_key_value().map(|(_, entry)| entry)
    }

    /// Removes and returns the oldest entry.
    pub fn remove_oldest(&mut self) -> Option<Arc<Entry>> {
        let (_, entry) = self.order.pop_first()?;
        self.by_key.remove(entry.key());
        self.current_size -= entry.size();
        Some(entry)
    }

    /// Removes exactly this entry, if it is still published.
    ///
    /// Returns `false` when the entry was already removed, or when its key now maps to a
    /// different entry.
    pub fn remove(&mut self, entry: &Arc<Entry>) -> bool {
        match self.by_key.get(entry.key()) {
            Some(slot) if Arc::ptr_eq(&slot.entry, entry) => {}
            _ => return false,
        }
        if let Some(slot) = self.by_key.remove(entry.key()) {
            self.order.remove(&slot.seq);
            self.current_size -= entry.size();
        }
        true
    }

    /// Moves the entry for `key` to the tail of the insertion order.
    pub fn touch(&mut self, key: &CacheKey) {
        let seq = self.next_seq();
        if let Some(slot) = self.by_key.get_mut(key)
            && let Some(entry) = self.order.remove(&slot.seq)
        {
            slot.seq = seq;
            self.order.insert(seq, entry);
        }
    }

    /// All keys, oldest first.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.order.values().map(|entry| entry.key().clone()).collect()
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    #[cfg(test)]
    pub fn assert_invariants(&self) {
        let total: u64 = self.order.values().map(|e| e.size()).sum();
        assert_eq!(self.current_size, total);
        assert!(self.current_size <= self.capacity);
        assert_eq!(self.by_key.len(), self.order.len());
        for (seq, entry) in &self.order {
            let slot = &self.by_key[entry.key()];
            assert_eq!(slot.seq, *seq);
            assert!(Arc::ptr_eq(&slot.entry, entry));
        }
    }
}
