// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! Capacity-bounded map with least-recently-used eviction.
//!
//! Recency is tracked in a queue of `(key, stamp)` pairs. Touching an entry pushes a fresh
//! stamp and leaves the old pair behind; stale pairs are skipped when they reach the front,
//! and the queue is compacted once it grows past a multiple of the live entry count.
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;

type EvictionHook<K, V> = Box<dyn FnMut(K, V) + Send>;

struct Slot<V> {
    value: V,
    stamp: u64,
}

pub struct BoundedMap<K, V> {
    capacity: usize,
    entries: HashMap<K, Slot<V>>,
    recency: VecDeque<(K, u64)>,
    next_stamp: u64,
    on_evict: Option<EvictionHook<K, V>>,
}

impl<K, V> fmt::Debug for BoundedMap<K, V>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedMap")
            .field("capacity", &self.capacity)
            .field("len", &self.entries.len())
            .finish()
    }
}

impl<K, V> BoundedMap<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: VecDeque::new(),
            next_stamp: 0,
            on_evict: None,
        }
    }

    /// Called with every entry pushed out by capacity. Not called by `remove`, `drain` or `clear`.
    pub fn set_eviction_hook(&mut self, hook: EvictionHook<K, V>) {
        self.on_evict = Some(hook);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Marks `key` most recently used. The slot takes its new stamp before the queue is
    /// compacted, so compaction never drops the pair just pushed.
    fn touch(&mut self, key: &K) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        let Some(slot) = self.entries.get_mut(key) else {
            return;
        };
        slot.stamp = stamp;
        self.recency.push_back((key.clone(), stamp));
        if self.recency.len() > 2 * self.entries.len() + 16 {
            let entries = &self.entries;
            self.recency
                .retain(|(k, s)| entries.get(k).is_some_and(|slot| slot.stamp == *s));
        }
    }

    /// Looks up `key` and marks it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.get_mut(key).map(|v| &*v)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.touch(key);
        self.entries.get_mut(key).map(|slot| &mut slot.value)
    }

    /// Looks up `key` without touching its recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Inserts or replaces `key`, returning the previous value. Evicts the least recently used
    /// entries when the map is over capacity.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                Some(std::mem::replace(&mut occupied.get_mut().value, value))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot { value, stamp: 0 });
                None
            }
        };
        self.touch(&key);
        while self.entries.len() > self.capacity {
            self.evict_oldest();
        }
        previous
    }

    fn evict_oldest(&mut self) {
        while let Some((key, stamp)) = self.recency.pop_front() {
            let live = self.entries.get(&key).is_some_and(|slot| slot.stamp == stamp);
            if !live {
                continue;
            }
            if let Some(slot) = self.entries.remove(&key) {
                if let Some(hook) = self.on_evict.as_mut() {
                    hook(key, slot.value);
                }
            }
            return;
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|slot| slot.value)
    }

    /// Keys from least to most recently used.
    pub fn keys(&self) -> Vec<K> {
        self.recency
            .iter()
            .filter(|(k, s)| self.entries.get(k).is_some_and(|slot| slot.stamp == *s))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.values_mut().map(|slot| &mut slot.value)
    }

    /// Removes every entry in least to most recently used order.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let keys = self.keys();
        let mut drained = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(slot) = self.entries.remove(&key) {
                drained.push((key, slot.value));
            }
        }
        self.recency.clear();
        drained
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }
}
