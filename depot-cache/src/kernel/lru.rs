//! Fixed-capacity, access-ordered partitions backed by the `lru` crate.

use depot_core::{CacheEntry, CacheKey, CacheValue, ConfigError, PartitionCapacity};
use lru::LruCache;
use std::num::NonZeroUsize;

use super::tiered::{Admission, Partition, TieredKernel};

/// An LRU partition. Reads through [`Partition::get_mut`] promote the key;
/// a full partition evicts its least recently used entry.
pub struct LruPartition<K, V> {
    entries: LruCache<K, CacheEntry<V>>,
}

impl<K: CacheKey, V: CacheValue> LruPartition<K, V> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Build from a configured capacity, which must be bounded and non-zero.
    pub fn with_capacity(field: &str, capacity: PartitionCapacity) -> Result<Self, ConfigError> {
        match capacity {
            PartitionCapacity::Unbounded => Err(ConfigError::IncompatibleOptions {
                option_a: "kind = Lru".to_string(),
                option_b: format!("{} = Unbounded", field),
            }),
            PartitionCapacity::Bounded(n) => NonZeroUsize::new(n).map(Self::new).ok_or_else(|| {
                ConfigError::invalid(field, n, "LRU partitions need a capacity of at least 1")
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}

impl<K: CacheKey, V: CacheValue> Partition<K, V> for LruPartition<K, V> {
    fn get_mut(&mut self, key: &K) -> Option<&mut CacheEntry<V>> {
        self.entries.get_mut(key)
    }

    fn peek(&self, key: &K) -> Option<&CacheEntry<V>> {
        self.entries.peek(key)
    }

    fn peek_mut(&mut self, key: &K) -> Option<&mut CacheEntry<V>> {
        self.entries.peek_mut(key)
    }

    fn insert(&mut self, key: K, entry: CacheEntry<V>) -> Admission<K, V> {
        // `push` also returns the replaced pair for an existing key; pop it
        // first so that anything returned is a real eviction.
        self.entries.pop(&key);
        match self.entries.push(key, entry) {
            Some((evicted, evicted_entry)) => Admission::Displaced(evicted, evicted_entry),
            None => Admission::Stored,
        }
    }

    fn remove(&mut self, key: &K) -> Option<CacheEntry<V>> {
        self.entries.pop(key)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|(key, _)| key.clone()).collect()
    }

    fn entries(&self) -> Vec<(K, CacheEntry<V>)> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }
}

/// Kernel over two [`LruPartition`]s.
///
/// Evicting from the valid partition demotes the entry to the invalid one
/// and reports [`KernelEvent::Expired`](super::KernelEvent::Expired);
/// evicting from the invalid partition drops it for good.
pub type LruKernel<K, V> = TieredKernel<K, V, LruPartition<K, V>>;

impl<K: CacheKey, V: CacheValue> TieredKernel<K, V, LruPartition<K, V>> {
    pub fn new(valid: PartitionCapacity, invalid: PartitionCapacity) -> Result<Self, ConfigError> {
        Ok(Self::from_partitions(
            LruPartition::with_capacity("valid_capacity", valid)?,
            LruPartition::with_capacity("invalid_capacity", invalid)?,
        ))
    }

    pub fn with_sizes(valid: NonZeroUsize, invalid: NonZeroUsize) -> Self {
        Self::from_partitions(LruPartition::new(valid), LruPartition::new(invalid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Kernel, KernelEvent, Lookup};

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).expect("non-zero")
    }

    fn kernel(valid: usize, invalid: usize) -> LruKernel<u32, u32> {
        LruKernel::with_sizes(nz(valid), nz(invalid))
    }

    #[test]
    fn test_eviction_demotes_least_recently_used() {
        let kernel = kernel(2, 2);
        let mut events = kernel.take_events().expect("first take");
        kernel.install(1, CacheEntry::new(Some(1)));
        kernel.install(2, CacheEntry::new(Some(2)));
        // Promote 1 so that 2 is the eviction candidate.
        assert!(kernel.touch(&1).is_valid());
        kernel.install(3, CacheEntry::new(Some(3)));

        assert!(kernel.peek(&1).is_valid());
        assert!(kernel.peek(&3).is_valid());
        match kernel.peek(&2) {
            Lookup::Invalid(e) => assert!(!e.is_valid()),
            other => panic!("expected demoted entry, got {:?}", other),
        }
        assert_eq!(events.try_recv().ok(), Some(KernelEvent::Expired(2)));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_invalid_overflow_is_dropped() {
        let kernel = kernel(1, 1);
        let mut events = kernel.take_events().expect("first take");
        kernel.install(1, CacheEntry::new(Some(1)));
        kernel.install(2, CacheEntry::new(Some(2)));
        kernel.install(3, CacheEntry::new(Some(3)));

        assert_eq!(kernel.valid_size(), 1);
        assert_eq!(kernel.invalid_size(), 1);
        assert!(matches!(kernel.peek(&1), Lookup::Missing));
        assert!(kernel.peek(&2).is_invalid());

        let received: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(
            received,
            vec![
                KernelEvent::Expired(1),
                KernelEvent::Expired(2),
                KernelEvent::Dropped(1),
            ]
        );
    }

    #[test]
    fn test_reinstall_existing_key_does_not_evict() {
        let kernel = kernel(2, 2);
        let mut events = kernel.take_events().expect("first take");
        kernel.install(1, CacheEntry::new(Some(1)));
        kernel.install(2, CacheEntry::new(Some(2)));
        let installed = kernel.install(2, CacheEntry::new(Some(20)));

        assert_eq!(installed.current.version(), 2);
        assert_eq!(kernel.valid_size(), 2);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_peek_does_not_promote() {
        let kernel = kernel(2, 2);
        kernel.install(1, CacheEntry::new(Some(1)));
        kernel.install(2, CacheEntry::new(Some(2)));
        assert!(kernel.peek(&1).is_valid());
        kernel.install(3, CacheEntry::new(Some(3)));
        assert!(kernel.peek(&1).is_invalid());
    }

    #[test]
    fn test_with_capacity_rejects_unusable_bounds() {
        assert!(matches!(
            LruPartition::<u32, u32>::with_capacity("valid_capacity", PartitionCapacity::Unbounded),
            Err(ConfigError::IncompatibleOptions { .. })
        ));
        assert!(matches!(
            LruPartition::<u32, u32>::with_capacity(
                "valid_capacity",
                PartitionCapacity::Bounded(0)
            ),
            Err(ConfigError::InvalidValue { .. })
        ));
        let partition =
            LruPartition::<u32, u32>::with_capacity("valid_capacity", PartitionCapacity::Bounded(7))
                .expect("bounded capacity");
        assert_eq!(partition.capacity(), 7);
    }
}
