//! Small ordered collections used by resolution contexts.
//!
//! - [`RecencyMap`]: map whose iteration order is most-recently-touched first.
//! - [`BoundedSet`]: insertion-ordered set that evicts its oldest entry when full.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct RecencyMap<K, V> {
    entries: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
    clock: u64,
}

impl<K, V> Default for RecencyMap<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            clock: 0,
        }
    }
}

impl<K: Hash + Eq + Clone, V> RecencyMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Inserts or replaces, marking the key most recent.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let stamp = self.tick();
        let previous = self.entries.insert(key.clone(), (value, stamp));
        if let Some((_, old_stamp)) = &previous {
            self.order.remove(old_stamp);
        }
        self.order.insert(stamp, key);
        previous.map(|(value, _)| value)
    }

    /// Marks the key most recent. Returns false when absent.
    pub fn touch(&mut self, key: &K) -> bool {
        let stamp = self.tick();
        match self.entries.get_mut(key) {
            Some(entry) => {
                self.order.remove(&entry.1);
                entry.1 = stamp;
                self.order.insert(stamp, key.clone());
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(value, _)| value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (value, stamp) = self.entries.remove(key)?;
        self.order.remove(&stamp);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recently touched first.
    pub fn iter_recent(&self) -> impl Iterator<Item = (&K, &V)> {
        self.order
            .values()
            .rev()
            .filter_map(|key| self.entries.get(key).map(|(value, _)| (key, value)))
    }
}

#[derive(Debug, Clone)]
pub struct BoundedSet<T> {
    capacity: usize,
    members: HashSet<T>,
    order: VecDeque<T>,
}

impl<T: Hash + Eq + Clone> BoundedSet<T> {
    /// A capacity of zero keeps nothing.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            members: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> bool {
        if self.capacity == 0 || self.members.contains(&value) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.members.insert(value.clone());
        self.order.push_back(value);
        true
    }

    pub fn contains(&self, value: &T) -> bool {
        self.members.contains(value)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recency_order_follows_touch() {
        let mut map = RecencyMap::new();
        map.insert("a", 1);
        map.insert("b", 2);
        map.insert("c", 3);

        map.touch(&"a");

        let keys: Vec<_> = map.iter_recent().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_recency_reinsert_replaces_value_and_moves_front() {
        let mut map = RecencyMap::new();
        map.insert("a", 1);
        map.insert("b", 2);

        let previous = map.insert("a", 10);

        assert_eq!(previous, Some(1));
        assert_eq!(map.len(), 2);
        assert_eq!(map.iter_recent().next(), Some((&"a", &10)));
    }

    #[test]
    fn test_recency_remove_and_touch_missing() {
        let mut map = RecencyMap::new();
        map.insert("a", 1);

        assert_eq!(map.remove(&"a"), Some(1));
        assert!(map.is_empty());
        assert!(!map.touch(&"a"));
        assert_eq!(map.iter_recent().count(), 0);
    }

    #[test]
    fn test_bounded_set_evicts_oldest() {
        let mut set = BoundedSet::new(2);
        set.insert("x");
        set.insert("y");
        set.insert("z");

        assert!(!set.contains(&"x"));
        assert!(set.contains(&"y"));
        assert!(set.contains(&"z"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_bounded_set_zero_capacity_keeps_nothing() {
        let mut set = BoundedSet::new(0);

        assert!(!set.insert(1));
        assert!(set.is_empty());
    }
}
