//! Depot statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Request counters. Reset independently of the cache contents.
#[derive(Debug, Default)]
pub(crate) struct DepotCounters {
    gets: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DepotCounters {
    pub(crate) fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub(crate) fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub(crate) fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self) {
        self.gets.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Statistics about depot usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DepotStats {
    /// Number of `get` calls.
    pub gets: u64,
    /// Number of gets answered from the valid partition.
    pub hits: u64,
    /// Number of gets that found no valid entry.
    pub misses: u64,
    /// Entries currently in the valid partition.
    pub valid_size: usize,
    /// Entries currently in the invalid partition.
    pub invalid_size: usize,
}

impl DepotStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn size(&self) -> usize {
        self.valid_size + self.invalid_size
    }
}
