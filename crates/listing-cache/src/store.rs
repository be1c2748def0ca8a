use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Fixed-capacity map that evicts in insertion order.
///
/// Updating an existing key keeps its position. Inserting a new key at
/// capacity evicts the oldest entry, which is never the key being inserted.
#[derive(Debug, Clone)]
pub struct BoundedMap<K, V> {
    order: VecDeque<K>,
    map: HashMap<K, V>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> BoundedMap<K, V> {
    /// Creates an empty map. A zero capacity is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            map: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Inserts or updates `key`, returning the evicted entry if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(slot) = self.map.get_mut(&key) {
            *slot = value;
            return None;
        }

        let evicted = if self.map.len() >= self.capacity {
            self.order
                .pop_front()
                .and_then(|old| self.map.remove(&old).map(|v| (old, v)))
        } else {
            None
        };

        self.order.push_back(key.clone());
        self.map.insert(key, value);
        evicted
    }

    /// Updates `key` only if it is present. Returns whether it was.
    pub fn replace(&mut self, key: &K, value: V) -> bool {
        match self.map.get_mut(key) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.map.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    /// Keys from oldest to newest.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.map.clear();
    }
}
