//! Two partitions behind one lock.
//!
//! [`TieredKernel`] implements the whole [`Kernel`] contract once, on top of
//! any [`Partition`]. Holding both partitions under a single mutex makes
//! every move between them one critical section, so no reader can observe
//! a key in both.

use depot_core::{CacheEntry, CacheKey, CacheValue, Filter, Timestamp};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::OnceLock;
use tokio::sync::mpsc;
use tracing::trace;

use super::{Installed, Kernel, KernelEvent, KernelEvents, Lookup};

/// What a partition did with an inserted entry.
#[derive(Debug)]
pub enum Admission<K, V> {
    /// Retained, nothing else affected.
    Stored,
    /// Retained, and another entry was pushed out to make room.
    Displaced(K, CacheEntry<V>),
    /// Not retained (pass-through partition).
    Refused(K, CacheEntry<V>),
}

/// One key→entry partition.
pub trait Partition<K, V>: Send {
    /// Read access that counts as a use (LRU promotion).
    fn get_mut(&mut self, key: &K) -> Option<&mut CacheEntry<V>>;

    /// Read access that does not count as a use.
    fn peek(&self, key: &K) -> Option<&CacheEntry<V>>;

    fn peek_mut(&mut self, key: &K) -> Option<&mut CacheEntry<V>>;

    /// Insert a key not currently present.
    fn insert(&mut self, key: K, entry: CacheEntry<V>) -> Admission<K, V>;

    fn remove(&mut self, key: &K) -> Option<CacheEntry<V>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);

    fn keys(&self) -> Vec<K>;

    fn entries(&self) -> Vec<(K, CacheEntry<V>)>;
}

struct Tiers<P> {
    valid: P,
    invalid: P,
}

impl<P> Tiers<P> {
    /// Move an entry that just left the valid partition into the invalid one.
    fn demote<K, V>(&mut self, key: K, mut entry: CacheEntry<V>, events: &mut Vec<KernelEvent<K>>)
    where
        P: Partition<K, V>,
    {
        entry.set_valid(false);
        match self.invalid.insert(key, entry) {
            Admission::Stored => {}
            Admission::Displaced(dropped, _) | Admission::Refused(dropped, _) => {
                events.push(KernelEvent::Dropped(dropped));
            }
        }
    }
}

/// A [`Kernel`] over two partitions of type `P`.
pub struct TieredKernel<K, V, P> {
    tiers: Mutex<Tiers<P>>,
    events: OnceLock<mpsc::UnboundedSender<KernelEvent<K>>>,
    _values: PhantomData<fn() -> V>,
}

impl<K, V, P> TieredKernel<K, V, P>
where
    K: CacheKey,
    V: CacheValue,
    P: Partition<K, V>,
{
    pub fn from_partitions(valid: P, invalid: P) -> Self {
        Self {
            tiers: Mutex::new(Tiers { valid, invalid }),
            events: OnceLock::new(),
            _values: PhantomData,
        }
    }

    /// Events produced before anyone took the receiver are discarded.
    fn emit(&self, events: Vec<KernelEvent<K>>) {
        for event in events {
            trace!(event = ?event, "Kernel event");
            if let Some(tx) = self.events.get() {
                let _ = tx.send(event);
            }
        }
    }

    fn invalidate_keys(&self, keys: impl FnOnce(&Tiers<P>) -> Vec<K>) -> Vec<K> {
        let mut events = Vec::new();
        let moved = {
            let mut tiers = self.tiers.lock();
            let keys = keys(&*tiers);
            for key in &keys {
                if let Some(entry) = tiers.valid.remove(key) {
                    tiers.demote(key.clone(), entry, &mut events);
                }
            }
            keys
        };
        self.emit(events);
        moved
    }
}

impl<K, V, P> Kernel<K, V> for TieredKernel<K, V, P>
where
    K: CacheKey,
    V: CacheValue,
    P: Partition<K, V>,
{
    fn valid_size(&self) -> usize {
        self.tiers.lock().valid.len()
    }

    fn invalid_size(&self) -> usize {
        self.tiers.lock().invalid.len()
    }

    fn size(&self) -> usize {
        let tiers = self.tiers.lock();
        tiers.valid.len() + tiers.invalid.len()
    }

    fn clear(&self) {
        let mut tiers = self.tiers.lock();
        tiers.valid.clear();
        tiers.invalid.clear();
    }

    fn touch(&self, key: &K) -> Lookup<V> {
        let mut tiers = self.tiers.lock();
        if let Some(entry) = tiers.valid.get_mut(key) {
            entry.set_last_access_time();
            return Lookup::Valid(entry.clone());
        }
        match tiers.invalid.peek(key) {
            Some(entry) => Lookup::Invalid(entry.clone()),
            None => Lookup::Missing,
        }
    }

    fn peek(&self, key: &K) -> Lookup<V> {
        let tiers = self.tiers.lock();
        if let Some(entry) = tiers.valid.peek(key) {
            return Lookup::Valid(entry.clone());
        }
        match tiers.invalid.peek(key) {
            Some(entry) => Lookup::Invalid(entry.clone()),
            None => Lookup::Missing,
        }
    }

    fn install(&self, key: K, entry: CacheEntry<V>) -> Installed<V> {
        let mut events = Vec::new();
        let installed = {
            let mut tiers = self.tiers.lock();
            let previous = match tiers.valid.remove(&key) {
                Some(entry) => Some(entry),
                None => tiers.invalid.remove(&key),
            };
            let mut current = match &previous {
                Some(previous) => entry.succeeding(previous),
                None => entry,
            };
            current.set_valid(true);

            match tiers.valid.insert(key, current.clone()) {
                Admission::Stored => {}
                Admission::Displaced(evicted, evicted_entry) => {
                    events.push(KernelEvent::Expired(evicted.clone()));
                    tiers.demote(evicted, evicted_entry, &mut events);
                }
                Admission::Refused(refused, _) => {
                    events.push(KernelEvent::Bypassed(refused));
                }
            }
            Installed { current, previous }
        };
        self.emit(events);
        installed
    }

    fn remove(&self, key: &K) -> Option<CacheEntry<V>> {
        let mut tiers = self.tiers.lock();
        match tiers.valid.remove(key) {
            Some(entry) => Some(entry),
            None => tiers.invalid.remove(key),
        }
    }

    fn invalidate(&self, key: &K) -> bool {
        let mut events = Vec::new();
        let moved = {
            let mut tiers = self.tiers.lock();
            match tiers.valid.remove(key) {
                Some(entry) => {
                    tiers.demote(key.clone(), entry, &mut events);
                    true
                }
                None => false,
            }
        };
        self.emit(events);
        moved
    }

    fn invalidate_all(&self, filter: Option<&dyn Filter<K>>) -> Vec<K> {
        self.invalidate_keys(|tiers| {
            let mut keys = tiers.valid.keys();
            if let Some(filter) = filter {
                keys.retain(|key| filter.accept(key));
            }
            keys
        })
    }

    fn remove_all(&self, filter: &dyn Filter<K>) -> Vec<K> {
        let mut tiers = self.tiers.lock();
        let mut removed = Vec::new();
        for key in tiers.valid.keys() {
            if filter.accept(&key) {
                tiers.valid.remove(&key);
                removed.push(key);
            }
        }
        for key in tiers.invalid.keys() {
            if filter.accept(&key) {
                tiers.invalid.remove(&key);
                removed.push(key);
            }
        }
        removed
    }

    fn invalidate_expired(&self, now: Timestamp) -> Vec<K> {
        self.invalidate_keys(|tiers| {
            tiers
                .valid
                .entries()
                .into_iter()
                .filter(|(_, entry)| entry.is_expired_at(now))
                .map(|(key, _)| key)
                .collect()
        })
    }

    fn set_expiration(&self, key: &K, at: Timestamp) -> bool {
        let mut tiers = self.tiers.lock();
        let Tiers { valid, invalid } = &mut *tiers;
        match valid.peek_mut(key).or_else(|| invalid.peek_mut(key)) {
            Some(entry) => {
                entry.set_expiration_time(Some(at));
                true
            }
            None => false,
        }
    }

    fn valid_entries(&self) -> Vec<(K, CacheEntry<V>)> {
        self.tiers.lock().valid.entries()
    }

    fn invalid_entries(&self) -> Vec<(K, CacheEntry<V>)> {
        self.tiers.lock().invalid.entries()
    }

    fn take_events(&self) -> Option<KernelEvents<K>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events.set(tx).ok()?;
        Some(rx)
    }
}
