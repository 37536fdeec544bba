//! The depot: cache facade and population policy.
//!
//! A [`Depot`] combines a [`Kernel`], an optional default [`Factory`], a
//! [`WorkQueue`] and the retriever registry. Reads that miss are coalesced
//! per key and populated on the queue; the caller waits at most its
//! [`Timeout`] and otherwise falls back to whatever stale entry exists.
//!
//! # Example
//!
//! ```ignore
//! let depot = Depot::builder()
//!     .factory(FnFactory::new(|key: &String| Ok(Some(key.len()))))
//!     .timeout(Timeout::After(Duration::from_millis(250)))
//!     .build()?;
//!
//! assert_eq!(depot.get(&"four".to_string()).await?, Some(4));
//! ```

use depot_core::{
    deadline_after, CacheEntry, CacheKey, CacheValue, ConfigError, DepotError, DepotResult,
    Factory, Filter, InvalidationListener, PopulateError, Timeout,
};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::builder::DepotBuilder;
use crate::kernel::{Kernel, KernelEvent, KernelEvents, Lookup};
use crate::queue::{JobTag, QueueStats, ServiceFuture, ServiceOutcome, Transaction, WorkQueue};
use crate::retriever::{Retrieved, Retriever, RetrieverRegistry};
use crate::stats::{DepotCounters, DepotStats};

/// A factory shared between the depot and its population jobs.
pub type SharedFactory<K, V> = Arc<dyn Factory<K, V>>;

/// Creation-time validity check for produced values.
pub(crate) type ValidityProbe<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

pub(crate) struct DepotInner<K: CacheKey, V: CacheValue> {
    pub(crate) kernel: Arc<dyn Kernel<K, V>>,
    pub(crate) factory: Option<SharedFactory<K, V>>,
    pub(crate) queue: WorkQueue,
    pub(crate) retrievers: RetrieverRegistry<K, V>,
    pub(crate) timeout: Timeout,
    pub(crate) invalid_no_wait: bool,
    pub(crate) validity: Option<ValidityProbe<V>>,
    pub(crate) listeners: RwLock<Vec<Arc<dyn InvalidationListener<K>>>>,
    pub(crate) events: Mutex<Option<KernelEvents<K>>>,
    pub(crate) counters: DepotCounters,
}

impl<K: CacheKey, V: CacheValue> DepotInner<K, V> {
    fn notify_invalidated(&self, keys: &[K]) {
        if keys.is_empty() {
            return;
        }
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for key in keys {
            debug!(key = ?key, "Entry invalidated");
            for listener in &listeners {
                listener.invalidated(key);
            }
        }
    }

    /// Apply whatever the kernel did on its own since the last call.
    fn drain_events(&self) {
        let events: Vec<KernelEvent<K>> = {
            let mut guard = self.events.lock();
            match guard.as_mut() {
                Some(rx) => std::iter::from_fn(|| rx.try_recv().ok()).collect(),
                None => return,
            }
        };

        let mut expired = Vec::new();
        for event in events {
            match event {
                KernelEvent::Expired(key) => expired.push(key),
                KernelEvent::Dropped(key) => trace!(key = ?key, "Stale entry dropped"),
                KernelEvent::Bypassed(key) => trace!(key = ?key, "Entry not retained"),
            }
        }
        self.notify_invalidated(&expired);
    }

    fn is_perished(&self, entry: &CacheEntry<V>, factory: &dyn Factory<K, V>) -> bool {
        if factory.valid_duration() == Some(Duration::ZERO) {
            return true;
        }
        match (&self.validity, entry.value()) {
            (Some(probe), Some(value)) => !probe(value),
            _ => false,
        }
    }

    /// Turn a factory result into the retriever's outcome, installing it
    /// when it is a fresh value. Results for a retriever that already
    /// settled (bypassed or cancelled) are discarded.
    fn settle(
        &self,
        retriever: &Retriever<K, V>,
        factory: &dyn Factory<K, V>,
        created: Result<Option<V>, PopulateError>,
        elapsed: Duration,
    ) {
        let key = retriever.key();
        {
            let _settling = retriever.settle_lock();
            if retriever.is_terminal() {
                debug!(key = ?key, "Discarding result for settled retriever");
                return;
            }

            let outcome = match created {
                Ok(value) => {
                    let mut entry = CacheEntry::new(value);
                    entry.set_retrieval_elapsed(elapsed);
                    if self.is_perished(&entry, factory) {
                        entry.set_valid(false);
                        Retrieved::Perished(entry)
                    } else {
                        if let Some(lifetime) = factory.valid_duration() {
                            entry.expire_after(lifetime);
                        }
                        Retrieved::Fresh(self.kernel.install(key.clone(), entry).current)
                    }
                }
                Err(PopulateError::Cancelled) => Retrieved::Unset,
                Err(PopulateError::Failed { reason }) => {
                    warn!(key = ?key, reason = %reason, "Factory failed");
                    Retrieved::Failed(reason)
                }
            };
            retriever.resolve(outcome);
        }
        self.drain_events();
    }

    /// Best entry available once population did not produce one.
    fn fallback(&self, key: &K, stale: Option<CacheEntry<V>>) -> Option<CacheEntry<V>> {
        self.kernel.peek(key).into_entry().or(stale)
    }
}

// ============================================================================
// POPULATION JOB
// ============================================================================

/// Settles and unregisters a retriever when dropped, whichever way its job ends.
struct RetrieverSlot<K: CacheKey, V: CacheValue> {
    depot: Weak<DepotInner<K, V>>,
    retriever: Arc<Retriever<K, V>>,
}

impl<K: CacheKey, V: CacheValue> Drop for RetrieverSlot<K, V> {
    fn drop(&mut self) {
        self.retriever.resolve(Retrieved::Unset);
        if let Some(depot) = self.depot.upgrade() {
            depot.retrievers.release(self.retriever.key(), &self.retriever);
        }
    }
}

/// Queue tag of the population job for `retriever`.
fn job_tag<K: CacheKey, V: CacheValue>(retriever: &Arc<Retriever<K, V>>) -> JobTag {
    Arc::as_ptr(retriever) as JobTag
}

struct PopulateJob<K: CacheKey, V: CacheValue> {
    slot: RetrieverSlot<K, V>,
    factory: SharedFactory<K, V>,
}

impl<K: CacheKey, V: CacheValue> Transaction for PopulateJob<K, V> {
    fn service(self: Box<Self>) -> ServiceFuture {
        Box::pin(async move {
            let PopulateJob { slot, factory } = *self;
            if !slot.retriever.begin_service() {
                return ServiceOutcome::Skipped;
            }

            let key = slot.retriever.key().clone();
            let started = Instant::now();
            let created = factory.create(&key).await;
            let elapsed = started.elapsed();

            if let Some(depot) = slot.depot.upgrade() {
                depot.settle(&slot.retriever, factory.as_ref(), created, elapsed);
            }
            ServiceOutcome::Completed
        })
    }

    fn cancel(self: Box<Self>) {
        debug!(key = ?self.slot.retriever.key(), "Population job cancelled");
    }
}

// ============================================================================
// DEPOT
// ============================================================================

/// A self-populating two-tier cache.
///
/// Cloning is cheap; clones share the same cache.
pub struct Depot<K: CacheKey, V: CacheValue> {
    inner: Arc<DepotInner<K, V>>,
}

impl<K: CacheKey, V: CacheValue> Clone for Depot<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, V: CacheValue> Depot<K, V> {
    pub fn builder() -> DepotBuilder<K, V> {
        DepotBuilder::new()
    }

    pub(crate) fn from_inner(inner: DepotInner<K, V>) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Get the value for `key` with the default factory and timeout.
    pub async fn get(&self, key: &K) -> DepotResult<Option<V>> {
        Ok(self.get_wrapped(key).await?.and_then(CacheEntry::into_value))
    }

    /// Get with the default factory and an explicit timeout.
    pub async fn get_within(&self, key: &K, timeout: Timeout) -> DepotResult<Option<V>> {
        Ok(self
            .get_wrapped_within(key, timeout)
            .await?
            .and_then(CacheEntry::into_value))
    }

    /// Get with `factory` used in place of the default one, should this call
    /// end up owning the population.
    pub async fn get_with(&self, factory: &SharedFactory<K, V>, key: &K) -> DepotResult<Option<V>> {
        self.get_with_timeout(factory, key, self.inner.timeout).await
    }

    pub async fn get_with_timeout(
        &self,
        factory: &SharedFactory<K, V>,
        key: &K,
        timeout: Timeout,
    ) -> DepotResult<Option<V>> {
        Ok(self
            .fetch(Some(factory), key, timeout)
            .await?
            .and_then(CacheEntry::into_value))
    }

    /// Like [`Depot::get`], returning the entry with its metadata.
    pub async fn get_wrapped(&self, key: &K) -> DepotResult<Option<CacheEntry<V>>> {
        self.get_wrapped_within(key, self.inner.timeout).await
    }

    pub async fn get_wrapped_within(
        &self,
        key: &K,
        timeout: Timeout,
    ) -> DepotResult<Option<CacheEntry<V>>> {
        self.fetch(None, key, timeout).await
    }

    pub async fn get_wrapped_with(
        &self,
        factory: &SharedFactory<K, V>,
        key: &K,
    ) -> DepotResult<Option<CacheEntry<V>>> {
        self.fetch(Some(factory), key, self.inner.timeout).await
    }

    pub async fn get_wrapped_with_timeout(
        &self,
        factory: &SharedFactory<K, V>,
        key: &K,
        timeout: Timeout,
    ) -> DepotResult<Option<CacheEntry<V>>> {
        self.fetch(Some(factory), key, timeout).await
    }

    /// `factory` overrides the default one; hits never need either.
    async fn fetch(
        &self,
        factory: Option<&SharedFactory<K, V>>,
        key: &K,
        timeout: Timeout,
    ) -> DepotResult<Option<CacheEntry<V>>> {
        let inner = &self.inner;
        inner.drain_events();
        inner.counters.record_get();

        let stale = match inner.kernel.touch(key) {
            Lookup::Valid(entry) => {
                inner.counters.record_hit();
                trace!(key = ?key, hits = entry.hits(), "Cache hit");
                return Ok(Some(entry));
            }
            Lookup::Invalid(entry) => Some(entry),
            Lookup::Missing => None,
        };
        inner.counters.record_miss();

        if inner.invalid_no_wait {
            if let Some(stale) = stale {
                trace!(key = ?key, "Serving stale entry without repopulating");
                return Ok(Some(stale));
            }
        }

        let Some(factory) = factory.or(inner.factory.as_ref()) else {
            return Err(DepotError::Config(ConfigError::MissingRequired {
                field: "factory".to_string(),
            }));
        };

        let retriever = inner.retrievers.obtain(key);
        let outcome = retriever
            .retrieve(factory, timeout, |owner| {
                let job = PopulateJob {
                    slot: RetrieverSlot {
                        depot: Arc::downgrade(inner),
                        retriever: Arc::clone(&retriever),
                    },
                    factory: owner,
                };
                inner
                    .queue
                    .enqueue_tagged(Box::new(job), timeout.is_priority(), job_tag(&retriever))
            })
            .await;
        inner.drain_events();

        match outcome {
            Some(Retrieved::Fresh(entry)) | Some(Retrieved::Perished(entry)) => Ok(Some(entry)),
            Some(Retrieved::Failed(reason)) => match inner.fallback(key, stale) {
                Some(entry) => Ok(Some(entry)),
                None => Err(DepotError::PopulationFailed { reason }),
            },
            Some(Retrieved::Unset) | None => Ok(inner.fallback(key, stale)),
        }
    }

    /// Read an entry without touching its access metadata or the counters.
    pub fn peek_wrapped(&self, key: &K) -> Option<CacheEntry<V>> {
        self.inner.kernel.peek(key).into_entry()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        !matches!(self.inner.kernel.peek(key), Lookup::Missing)
    }

    pub fn valid_contains_key(&self, key: &K) -> bool {
        self.inner.kernel.peek(key).is_valid()
    }

    pub fn invalid_contains_key(&self, key: &K) -> bool {
        self.inner.kernel.peek(key).is_invalid()
    }

    pub fn valid_keys(&self) -> Vec<K> {
        self.inner
            .kernel
            .valid_entries()
            .into_iter()
            .map(|(key, _)| key)
            .collect()
    }

    pub fn invalid_keys(&self) -> Vec<K> {
        self.inner
            .kernel
            .invalid_entries()
            .into_iter()
            .map(|(key, _)| key)
            .collect()
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Install `value` as the valid entry for `key`, returning whatever was
    /// cached before from either partition.
    ///
    /// A population in flight for the key is resolved with this value.
    pub fn put(&self, key: K, value: Option<V>) -> Option<CacheEntry<V>> {
        let inner = &self.inner;
        let in_flight = inner.retrievers.get(&key);
        let installed = match &in_flight {
            Some(retriever) => {
                let _settling = retriever.settle_lock();
                let installed = inner.kernel.install(key.clone(), CacheEntry::new(value));
                if retriever.bypass(installed.current.clone()) {
                    debug!(key = ?key, "Put bypassed in-flight population");
                }
                installed
            }
            None => inner.kernel.install(key.clone(), CacheEntry::new(value)),
        };
        if let Some(retriever) = in_flight {
            inner.retrievers.release(&key, &retriever);
        }
        inner.drain_events();
        installed.previous
    }

    /// Delete `key` from both partitions.
    pub fn remove(&self, key: &K) -> Option<CacheEntry<V>> {
        let removed = self.inner.kernel.remove(key);
        if removed.is_some() {
            debug!(key = ?key, "Entry removed");
        }
        removed
    }

    /// Move the valid entry for `key` to the invalid partition.
    pub fn invalidate(&self, key: &K) -> bool {
        let moved = self.inner.kernel.invalidate(key);
        if moved {
            self.inner.notify_invalidated(std::slice::from_ref(key));
        }
        self.inner.drain_events();
        moved
    }

    /// Invalidate every valid entry. Returns the number moved.
    pub fn invalidate_all(&self) -> usize {
        let moved = self.inner.kernel.invalidate_all(None);
        self.inner.notify_invalidated(&moved);
        self.inner.drain_events();
        moved.len()
    }

    /// Invalidate the valid entries whose keys `filter` accepts.
    pub fn invalidate_matching(&self, filter: &dyn Filter<K>) -> usize {
        let moved = self.inner.kernel.invalidate_all(Some(filter));
        self.inner.notify_invalidated(&moved);
        self.inner.drain_events();
        moved.len()
    }

    /// Delete the entries whose keys `filter` accepts from both partitions.
    pub fn remove_all(&self, filter: &dyn Filter<K>) -> usize {
        let removed = self.inner.kernel.remove_all(filter);
        debug!(count = removed.len(), "Entries removed");
        removed.len()
    }

    /// Empty both partitions. Listeners are not notified.
    pub fn clear(&self) {
        self.inner.kernel.clear();
        self.inner.drain_events();
        debug!("Depot cleared");
    }

    /// Invalidate every valid entry whose expiration time has passed.
    pub fn evict(&self) -> usize {
        let expired = self.inner.kernel.invalidate_expired(chrono::Utc::now());
        self.inner.notify_invalidated(&expired);
        self.inner.drain_events();
        expired.len()
    }

    /// Expire the entry for `key` after `after`. A zero duration makes it due
    /// on the next [`Depot::evict`].
    pub fn set_expiration(&self, key: &K, after: Duration) -> bool {
        self.inner.kernel.set_expiration(key, deadline_after(after))
    }

    /// Release the callers waiting on the population of `key`, if any. A
    /// job still queued for it is withdrawn; one already running finishes
    /// and its result is discarded.
    pub fn cancel(&self, key: &K) -> bool {
        let Some(retriever) = self.inner.retrievers.get(key) else {
            return false;
        };
        let cancelled = retriever.cancel();
        self.inner.queue.withdraw(job_tag(&retriever));
        self.inner.retrievers.release(key, &retriever);
        cancelled
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    pub fn add_invalidation_listener(&self, listener: Arc<dyn InvalidationListener<K>>) {
        self.inner.listeners.write().push(listener);
    }

    /// Remove a listener previously added, compared by identity.
    pub fn remove_invalidation_listener(
        &self,
        listener: &Arc<dyn InvalidationListener<K>>,
    ) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| Arc::as_ptr(l) as *const () != target);
        listeners.len() != before
    }

    // ------------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------------

    pub fn size(&self) -> usize {
        self.inner.kernel.size()
    }

    pub fn valid_size(&self) -> usize {
        self.inner.kernel.valid_size()
    }

    pub fn invalid_size(&self) -> usize {
        self.inner.kernel.invalid_size()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.kernel.is_empty()
    }

    pub fn cache_hits(&self) -> u64 {
        self.inner.counters.hits()
    }

    pub fn cache_misses(&self) -> u64 {
        self.inner.counters.misses()
    }

    pub fn cache_gets(&self) -> u64 {
        self.inner.counters.gets()
    }

    pub fn stats(&self) -> DepotStats {
        DepotStats {
            gets: self.inner.counters.gets(),
            hits: self.inner.counters.hits(),
            misses: self.inner.counters.misses(),
            valid_size: self.inner.kernel.valid_size(),
            invalid_size: self.inner.kernel.invalid_size(),
        }
    }

    /// Zero the counters. Cache contents are kept.
    pub fn reset(&self) {
        self.inner.counters.reset();
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    /// Number of keys with a population in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.retrievers.len()
    }

    pub fn timeout(&self) -> Timeout {
        self.inner.timeout
    }

    pub fn invalid_no_wait(&self) -> bool {
        self.inner.invalid_no_wait
    }

    /// Stop the work queue. Queued populations resolve unset; reads after
    /// this fall back to cached entries only.
    pub async fn shutdown(&self) {
        self.inner.queue.shutdown().await;
    }

    /// Key→value view of both partitions; partition membership is dropped.
    pub fn snapshot(&self) -> HashMap<K, Option<V>> {
        let kernel = &self.inner.kernel;
        kernel
            .invalid_entries()
            .into_iter()
            .chain(kernel.valid_entries())
            .map(|(key, entry)| (key, entry.into_value()))
            .collect()
    }
}

impl<K: CacheKey, V: CacheValue + PartialEq> PartialEq for Depot<K, V> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.snapshot() == other.snapshot()
    }
}

impl<K: CacheKey, V: CacheValue + Eq> Eq for Depot<K, V> {}

impl<K: CacheKey, V: CacheValue + Hash> Hash for Depot<K, V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Order-independent so that equal contents hash equally.
        let mut combined: u64 = 0;
        let snapshot = self.snapshot();
        for pair in &snapshot {
            let mut hasher = DefaultHasher::new();
            pair.hash(&mut hasher);
            combined = combined.wrapping_add(hasher.finish());
        }
        snapshot.len().hash(state);
        combined.hash(state);
    }
}

impl<K: CacheKey, V: CacheValue> fmt::Debug for Depot<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Depot")
            .field("stats", &self.stats())
            .field("timeout", &self.inner.timeout)
            .field("invalid_no_wait", &self.inner.invalid_no_wait)
            .field("in_flight", &self.inner.retrievers.len())
            .finish()
    }
}
