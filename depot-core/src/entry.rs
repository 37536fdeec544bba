//! The cache entry wrapper.
//!
//! A [`CacheEntry`] carries a value (which may legitimately be absent) plus
//! the bookkeeping the depot needs: when it arrived, how often it was read,
//! how many times its value was replaced, and when it expires.

use chrono::Utc;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::Timestamp;

/// The instant `duration` from now, saturating at the latest representable time.
pub fn deadline_after(duration: Duration) -> Timestamp {
    let delta = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(delta)
        .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC)
}

/// A cached value plus population metadata.
///
/// # Invariants
///
/// - `version` starts at 1 and only moves when the wrapped value is replaced
///   ([`CacheEntry::set_last_update_time`]), never on access.
/// - `hits` only moves on access ([`CacheEntry::set_last_access_time`]); the
///   call that created the entry does not count.
///
/// Equality and hashing look only at the wrapped value.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    value: Option<V>,
    arrival_time: Timestamp,
    last_access_time: Option<Timestamp>,
    last_update_time: Timestamp,
    expiration_time: Option<Timestamp>,
    hits: u64,
    version: u64,
    retrieval_elapsed: Duration,
    valid: bool,
}

impl<V> CacheEntry<V> {
    /// Wrap a freshly produced value.
    pub fn new(value: Option<V>) -> Self {
        let now = Utc::now();
        Self {
            value,
            arrival_time: now,
            last_access_time: None,
            last_update_time: now,
            expiration_time: None,
            hits: 0,
            version: 1,
            retrieval_elapsed: Duration::ZERO,
            valid: true,
        }
    }

    /// Make this entry the successor of `previous` for the same key: its
    /// version continues from the previous one.
    pub fn succeeding(mut self, previous: &CacheEntry<V>) -> Self {
        self.version = previous.version;
        self.set_last_update_time();
        self
    }

    /// Get a reference to the wrapped value.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Consume the wrapper and return the wrapped value.
    pub fn into_value(self) -> Option<V> {
        self.value
    }

    /// Replace the wrapped value, returning the old one.
    ///
    /// This does not touch `version`; callers pair it with
    /// [`CacheEntry::set_last_update_time`].
    pub fn set_value(&mut self, value: Option<V>) -> Option<V> {
        std::mem::replace(&mut self.value, value)
    }

    /// Record a read of this entry.
    pub fn set_last_access_time(&mut self) {
        self.last_access_time = Some(Utc::now());
        self.hits += 1;
    }

    /// Record a replacement of the wrapped value.
    pub fn set_last_update_time(&mut self) {
        self.last_update_time = Utc::now();
        self.version += 1;
    }

    /// Set (or clear) the absolute expiration time.
    pub fn set_expiration_time(&mut self, at: Option<Timestamp>) {
        self.expiration_time = at;
    }

    /// Expire `duration` from now. A zero duration expires immediately.
    pub fn expire_after(&mut self, duration: Duration) {
        self.expiration_time = Some(deadline_after(duration));
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    pub fn set_retrieval_elapsed(&mut self, elapsed: Duration) {
        self.retrieval_elapsed = elapsed;
    }

    /// True once the entry has been read at least once after creation.
    pub fn was_cached(&self) -> bool {
        self.last_access_time.is_some()
    }

    /// True if the entry has an expiration time at or before `now`.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expiration_time.is_some_and(|at| at <= now)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn arrival_time(&self) -> Timestamp {
        self.arrival_time
    }

    pub fn last_access_time(&self) -> Option<Timestamp> {
        self.last_access_time
    }

    pub fn last_update_time(&self) -> Timestamp {
        self.last_update_time
    }

    pub fn expiration_time(&self) -> Option<Timestamp> {
        self.expiration_time
    }

    /// How long the factory took to produce the value.
    pub fn retrieval_elapsed(&self) -> Duration {
        self.retrieval_elapsed
    }
}

impl<V: PartialEq> PartialEq for CacheEntry<V> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<V: Eq> Eq for CacheEntry<V> {}

impl<V: Hash> Hash for CacheEntry<V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}
