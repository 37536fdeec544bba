//! Kernel: the valid/invalid partition pair behind a depot.
//!
//! A kernel owns two key→entry partitions. An entry lives in exactly one of
//! them at a time; invalidation *moves* it from valid to invalid, removal
//! destroys it. The depot never reaches into the partitions directly, it
//! goes through the [`Kernel`] contract so that other storage can be
//! substituted.
//!
//! # Events
//!
//! Kernels that evict on their own (capacity bounds) report it through an
//! explicit channel of [`KernelEvent`]s instead of calling back into the
//! depot. The depot drains the channel after each mutating operation.

use depot_core::{CacheEntry, CacheKey, CacheValue, Filter, KernelConfig, KernelKind, Timestamp};
use std::sync::Arc;
use tokio::sync::mpsc;

mod lru;
mod map;
mod tiered;

pub use self::lru::{LruKernel, LruPartition};
pub use self::map::{MapKernel, MapPartition};
pub use self::tiered::{Admission, Partition, TieredKernel};

/// Something a kernel did on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent<K> {
    /// A valid entry was pushed out of the valid partition into the invalid
    /// one. Treated exactly like an explicit invalidation.
    Expired(K),
    /// An invalid entry was pushed out of the invalid partition and is gone.
    Dropped(K),
    /// A pass-through partition refused to retain an entry.
    Bypassed(K),
}

/// Receiving half of a kernel's event channel.
pub type KernelEvents<K> = mpsc::UnboundedReceiver<KernelEvent<K>>;

/// Where a key was found.
#[derive(Debug, Clone)]
pub enum Lookup<V> {
    Valid(CacheEntry<V>),
    Invalid(CacheEntry<V>),
    Missing,
}

impl<V> Lookup<V> {
    /// The entry regardless of partition.
    pub fn into_entry(self) -> Option<CacheEntry<V>> {
        match self {
            Self::Valid(entry) | Self::Invalid(entry) => Some(entry),
            Self::Missing => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }
}

/// Result of installing an entry into the valid partition.
#[derive(Debug, Clone)]
pub struct Installed<V> {
    /// The entry as installed, with its version continued from `previous`.
    pub current: CacheEntry<V>,
    /// Whatever was cached for the key before, from either partition.
    pub previous: Option<CacheEntry<V>>,
}

/// Storage contract for the two partitions.
///
/// All operations are synchronous and must be safe to call from many
/// threads; none of them is ever held across a factory call.
pub trait Kernel<K: CacheKey, V: CacheValue>: Send + Sync {
    fn valid_size(&self) -> usize;

    fn invalid_size(&self) -> usize;

    fn size(&self) -> usize {
        self.valid_size() + self.invalid_size()
    }

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Empty both partitions. No events are emitted.
    fn clear(&self);

    /// Look a key up as a read: a valid hit records an access on the entry.
    fn touch(&self, key: &K) -> Lookup<V>;

    /// Look a key up without recording anything.
    fn peek(&self, key: &K) -> Lookup<V>;

    /// Install `entry` as the valid entry for `key`, evicting any invalid
    /// entry for it and continuing its version.
    fn install(&self, key: K, entry: CacheEntry<V>) -> Installed<V>;

    /// Delete the key from both partitions.
    fn remove(&self, key: &K) -> Option<CacheEntry<V>>;

    /// Move the key's valid entry to the invalid partition.
    ///
    /// Returns false if the key was not valid.
    fn invalidate(&self, key: &K) -> bool;

    /// Move every valid entry accepted by `filter` (all of them when `None`)
    /// to the invalid partition, returning the moved keys.
    fn invalidate_all(&self, filter: Option<&dyn Filter<K>>) -> Vec<K>;

    /// Delete every entry accepted by `filter` from both partitions,
    /// returning the deleted keys.
    fn remove_all(&self, filter: &dyn Filter<K>) -> Vec<K>;

    /// Invalidate every valid entry whose expiration time is at or before
    /// `now`, returning the moved keys.
    fn invalidate_expired(&self, now: Timestamp) -> Vec<K>;

    /// Set the expiration time of the key's entry, in whichever partition.
    fn set_expiration(&self, key: &K, at: Timestamp) -> bool;

    /// Snapshot of the valid partition.
    fn valid_entries(&self) -> Vec<(K, CacheEntry<V>)>;

    /// Snapshot of the invalid partition.
    fn invalid_entries(&self) -> Vec<(K, CacheEntry<V>)>;

    /// Hand over the event receiver. Only the first call gets it; kernels
    /// that never evict on their own return `None`.
    fn take_events(&self) -> Option<KernelEvents<K>> {
        None
    }
}

/// Build the kernel described by `config`.
pub fn kernel_from_config<K: CacheKey, V: CacheValue>(
    config: &KernelConfig,
) -> Result<Arc<dyn Kernel<K, V>>, depot_core::ConfigError> {
    config.validate()?;
    let kernel: Arc<dyn Kernel<K, V>> = match config.kind {
        KernelKind::Map => Arc::new(MapKernel::new(
            config.valid_capacity,
            config.invalid_capacity,
        )),
        KernelKind::Lru => Arc::new(LruKernel::new(
            config.valid_capacity,
            config.invalid_capacity,
        )?),
    };
    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::PartitionCapacity;

    #[test]
    fn test_kernel_from_default_config_is_map() {
        let kernel = kernel_from_config::<String, u32>(&KernelConfig::default())
            .expect("default kernel config is valid");
        kernel.install("a".to_string(), CacheEntry::new(Some(1)));
        assert_eq!(kernel.valid_size(), 1);
    }

    #[test]
    fn test_kernel_from_lru_config() {
        let kernel = kernel_from_config::<u32, u32>(&KernelConfig::lru(2, 2))
            .expect("lru config is valid");
        for k in 0..3 {
            kernel.install(k, CacheEntry::new(Some(k)));
        }
        assert_eq!(kernel.valid_size(), 2);
        assert_eq!(kernel.invalid_size(), 1);
    }

    #[test]
    fn test_kernel_from_invalid_lru_config() {
        let config = KernelConfig::new()
            .with_kind(KernelKind::Lru)
            .with_valid_capacity(PartitionCapacity::Bounded(0));
        assert!(kernel_from_config::<u32, u32>(&config).is_err());
    }

    #[test]
    fn test_lookup_accessors() {
        let valid = Lookup::Valid(CacheEntry::new(Some(1)));
        let invalid = Lookup::Invalid(CacheEntry::new(Some(2)));
        assert!(valid.is_valid());
        assert!(invalid.is_invalid());
        assert_eq!(invalid.into_entry().and_then(|e| e.into_value()), Some(2));
        assert!(Lookup::<u32>::Missing.into_entry().is_none());
    }
}
