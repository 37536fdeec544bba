//! Plain map partitions.

use depot_core::{CacheEntry, CacheKey, CacheValue, PartitionCapacity};
use std::collections::HashMap;

use super::tiered::{Admission, Partition, TieredKernel};

/// A hash map partition with an optional size bound.
///
/// When bounded and full, an arbitrary resident entry is displaced. A bound
/// of zero retains nothing.
pub struct MapPartition<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    capacity: PartitionCapacity,
}

impl<K: CacheKey, V: CacheValue> MapPartition<K, V> {
    pub fn new(capacity: PartitionCapacity) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
        }
    }
}

impl<K: CacheKey, V: CacheValue> Partition<K, V> for MapPartition<K, V> {
    fn get_mut(&mut self, key: &K) -> Option<&mut CacheEntry<V>> {
        self.entries.get_mut(key)
    }

    fn peek(&self, key: &K) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    fn peek_mut(&mut self, key: &K) -> Option<&mut CacheEntry<V>> {
        self.entries.get_mut(key)
    }

    fn insert(&mut self, key: K, entry: CacheEntry<V>) -> Admission<K, V> {
        let Some(limit) = self.capacity.limit() else {
            self.entries.insert(key, entry);
            return Admission::Stored;
        };
        if limit == 0 {
            return Admission::Refused(key, entry);
        }
        if self.entries.contains_key(&key) || self.entries.len() < limit {
            self.entries.insert(key, entry);
            return Admission::Stored;
        }

        let victim = self.entries.keys().next().cloned();
        let displaced = victim.and_then(|victim| {
            self.entries
                .remove(&victim)
                .map(|evicted| (victim, evicted))
        });
        self.entries.insert(key, entry);
        match displaced {
            Some((victim, evicted)) => Admission::Displaced(victim, evicted),
            None => Admission::Stored,
        }
    }

    fn remove(&mut self, key: &K) -> Option<CacheEntry<V>> {
        self.entries.remove(key)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn keys(&self) -> Vec<K> {
        self.entries.keys().cloned().collect()
    }

    fn entries(&self) -> Vec<(K, CacheEntry<V>)> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }
}

/// Kernel over two [`MapPartition`]s.
pub type MapKernel<K, V> = TieredKernel<K, V, MapPartition<K, V>>;

impl<K: CacheKey, V: CacheValue> TieredKernel<K, V, MapPartition<K, V>> {
    /// A map kernel with the given partition bounds. `Bounded(0)` makes a
    /// partition pass-through.
    pub fn new(valid: PartitionCapacity, invalid: PartitionCapacity) -> Self {
        Self::from_partitions(MapPartition::new(valid), MapPartition::new(invalid))
    }

    pub fn unbounded() -> Self {
        Self::new(PartitionCapacity::Unbounded, PartitionCapacity::Unbounded)
    }
}
