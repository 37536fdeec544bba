//! Single-flight population of one key.
//!
//! A [`Retriever`] exists while a key is being (re)populated. The first
//! caller to reach it becomes the owner: its factory is the one that runs,
//! and it dispatches the population job. Every caller that joins before
//! the retriever settles observes the same outcome.
//!
//! ```text
//! Created ─► Dispatched ─► Running ─► Resolved(outcome)
//!    │            │            │
//!    └────────────┴────────────┴────► Resolved (bypass) | Cancelled
//! ```
//!
//! Once settled, a retriever is never reused; the registry replaces it for
//! the next caller. No lock is held across the factory call.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use depot_core::{CacheEntry, CacheKey, CacheValue, Factory, QueueError, Timeout};
use parking_lot::{Mutex, MutexGuard};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::watch;
use tracing::debug;

/// How a population attempt ended.
#[derive(Debug, Clone)]
pub enum Retrieved<V> {
    /// A value was produced (or supplied by a bypass) and installed.
    Fresh(CacheEntry<V>),
    /// A value was produced but was already stale; it was not installed.
    Perished(CacheEntry<V>),
    /// Nothing was produced: refused, cancelled or interrupted.
    Unset,
    /// The factory failed.
    Failed(String),
}

/// Lifecycle of a retriever.
#[derive(Debug, Clone)]
pub enum RetrievalState<V> {
    Created,
    Dispatched,
    Running,
    Resolved(Retrieved<V>),
    Cancelled,
}

impl<V> RetrievalState<V> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved(_) | Self::Cancelled)
    }
}

/// Coordinator for one in-flight population.
pub struct Retriever<K: CacheKey, V: CacheValue> {
    key: K,
    owner: OnceLock<Arc<dyn Factory<K, V>>>,
    state: watch::Sender<RetrievalState<V>>,
    settle: Mutex<()>,
    created_at: Instant,
}

impl<K: CacheKey, V: CacheValue> Retriever<K, V> {
    pub fn new(key: K) -> Self {
        let (state, _) = watch::channel(RetrievalState::Created);
        Self {
            key,
            owner: OnceLock::new(),
            state,
            settle: Mutex::new(()),
            created_at: Instant::now(),
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// The factory of the caller that dispatched this retriever.
    pub fn owner(&self) -> Option<&Arc<dyn Factory<K, V>>> {
        self.owner.get()
    }

    pub fn state(&self) -> RetrievalState<V> {
        self.state.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.borrow().is_terminal()
    }

    /// The settled outcome, if any. Cancellation reads as [`Retrieved::Unset`].
    pub fn outcome(&self) -> Option<Retrieved<V>> {
        match &*self.state.borrow() {
            RetrievalState::Resolved(outcome) => Some(outcome.clone()),
            RetrievalState::Cancelled => Some(Retrieved::Unset),
            _ => None,
        }
    }

    /// Join this retriever and wait up to `timeout` for its outcome.
    ///
    /// If the caller is the first to arrive, `factory` becomes the owner and
    /// `dispatch` is called with it to enqueue the population job. A refused
    /// dispatch settles the retriever as unset right away. Later callers'
    /// factories are ignored.
    ///
    /// Returns `None` when the retriever did not settle within `timeout`.
    pub async fn retrieve<D>(
        &self,
        factory: &Arc<dyn Factory<K, V>>,
        timeout: Timeout,
        dispatch: D,
    ) -> Option<Retrieved<V>>
    where
        D: FnOnce(Arc<dyn Factory<K, V>>) -> Result<(), QueueError>,
    {
        let mut rx = self.state.subscribe();

        if self.claim(factory) {
            debug!(key = ?self.key, priority = timeout.is_priority(), "Dispatching retriever");
            if let Err(e) = dispatch(Arc::clone(factory)) {
                debug!(key = ?self.key, error = %e, "Retriever dispatch refused");
                self.resolve(Retrieved::Unset);
            }
        }

        match timeout {
            Timeout::Immediate => {}
            Timeout::After(limit) => {
                let _ = tokio::time::timeout(limit, rx.wait_for(RetrievalState::is_terminal)).await;
            }
            Timeout::Forever => {
                let _ = rx.wait_for(RetrievalState::is_terminal).await;
            }
        }
        self.outcome()
    }

    /// Become the owner if nobody has yet.
    fn claim(&self, factory: &Arc<dyn Factory<K, V>>) -> bool {
        let claimed = self.state.send_if_modified(|state| {
            if matches!(state, RetrievalState::Created) {
                *state = RetrievalState::Dispatched;
                true
            } else {
                false
            }
        });
        if claimed {
            let _ = self.owner.set(Arc::clone(factory));
        }
        claimed
    }

    /// Mark the job as running. False if the retriever already settled, in
    /// which case the factory should not be called.
    pub fn begin_service(&self) -> bool {
        let mut runnable = false;
        self.state.send_if_modified(|state| match state {
            RetrievalState::Created | RetrievalState::Dispatched => {
                *state = RetrievalState::Running;
                runnable = true;
                true
            }
            RetrievalState::Running => {
                runnable = true;
                false
            }
            _ => false,
        });
        runnable
    }

    /// Settle with `outcome` unless already settled.
    pub fn resolve(&self, outcome: Retrieved<V>) -> bool {
        let kind = outcome_name(&outcome);
        let resolved = self.state.send_if_modified(move |state| {
            if state.is_terminal() {
                return false;
            }
            *state = RetrievalState::Resolved(outcome);
            true
        });
        if resolved {
            debug!(
                key = ?self.key,
                outcome = kind,
                elapsed_ms = self.created_at.elapsed().as_millis() as u64,
                "Retriever resolved"
            );
        }
        resolved
    }

    /// Settle with a value supplied from outside, skipping the factory.
    pub fn bypass(&self, entry: CacheEntry<V>) -> bool {
        self.resolve(Retrieved::Fresh(entry))
    }

    /// Release every waiter with an unset outcome.
    pub fn cancel(&self) -> bool {
        let cancelled = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = RetrievalState::Cancelled;
            true
        });
        if cancelled {
            debug!(key = ?self.key, "Retriever cancelled");
        }
        cancelled
    }

    /// Serialises installing a population result against a concurrent
    /// bypass for the same key. Never held across an await.
    pub fn settle_lock(&self) -> MutexGuard<'_, ()> {
        self.settle.lock()
    }
}

fn outcome_name<V>(outcome: &Retrieved<V>) -> &'static str {
    match outcome {
        Retrieved::Fresh(_) => "fresh",
        Retrieved::Perished(_) => "perished",
        Retrieved::Unset => "unset",
        Retrieved::Failed(_) => "failed",
    }
}

impl<K: CacheKey, V: CacheValue> std::fmt::Debug for Retriever<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("key", &self.key)
            .field("terminal", &self.is_terminal())
            .field("owned", &self.owner.get().is_some())
            .finish()
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// The in-flight retrievers, one per key.
pub struct RetrieverRegistry<K: CacheKey, V: CacheValue> {
    in_flight: DashMap<K, Arc<Retriever<K, V>>>,
}

impl<K: CacheKey, V: CacheValue> Default for RetrieverRegistry<K, V> {
    fn default() -> Self {
        Self {
            in_flight: DashMap::new(),
        }
    }
}

impl<K: CacheKey, V: CacheValue> RetrieverRegistry<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the live retriever for `key`, or install a new one. A settled
    /// retriever still registered is replaced.
    pub fn obtain(&self, key: &K) -> Arc<Retriever<K, V>> {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_terminal() {
                    let fresh = Arc::new(Retriever::new(key.clone()));
                    occupied.insert(Arc::clone(&fresh));
                    fresh
                } else {
                    Arc::clone(occupied.get())
                }
            }
            Entry::Vacant(vacant) => {
                debug!(key = ?key, "Creating retriever");
                let fresh = Arc::new(Retriever::new(key.clone()));
                vacant.insert(Arc::clone(&fresh));
                fresh
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<Retriever<K, V>>> {
        self.in_flight.get(key).map(|r| Arc::clone(r.value()))
    }

    /// Unregister `retriever`, but only if it is still the one registered
    /// for `key`.
    pub fn release(&self, key: &K, retriever: &Arc<Retriever<K, V>>) -> bool {
        self.in_flight
            .remove_if(key, |_, registered| Arc::ptr_eq(registered, retriever))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}
