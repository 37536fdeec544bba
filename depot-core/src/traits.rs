//! Capability traits the depot is parameterised over.
//!
//! Each capability is deliberately narrow (one or two methods) so that
//! embedding code can supply closures or small adapters.

use async_trait::async_trait;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use crate::error::PopulateError;

/// Bounds every cache key satisfies.
///
/// Absent keys are expressed by the caller as `Option<K>`.
pub trait CacheKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Bounds every cached value satisfies.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

/// Produces the value for a key on a cache miss.
///
/// `Ok(None)` is a legitimate result: the key maps to "no value" and that
/// absence is cached like any other value.
///
/// # Perishables
///
/// A factory whose values have a fixed lifetime overrides
/// [`Factory::valid_duration`]. `Some(ZERO)` means values are stale the
/// moment they are created and are never installed as valid.
#[async_trait]
pub trait Factory<K: CacheKey, V: CacheValue>: Send + Sync {
    /// Create the value for `key`.
    async fn create(&self, key: &K) -> Result<Option<V>, PopulateError>;

    /// How long created values stay valid, if bounded.
    fn valid_duration(&self) -> Option<Duration> {
        None
    }
}

/// A value able to declare itself already stale when it is created.
pub trait Perishable {
    fn is_valid(&self) -> bool;
}

/// Key predicate used by bulk invalidate and remove.
pub trait Filter<K>: Send + Sync {
    fn accept(&self, key: &K) -> bool;
}

impl<K, F> Filter<K> for F
where
    F: Fn(&K) -> bool + Send + Sync,
{
    fn accept(&self, key: &K) -> bool {
        self(key)
    }
}

/// Notified with the key of every entry moved to the invalid partition.
pub trait InvalidationListener<K>: Send + Sync {
    fn invalidated(&self, key: &K);
}

impl<K, F> InvalidationListener<K> for F
where
    F: Fn(&K) + Send + Sync,
{
    fn invalidated(&self, key: &K) {
        self(key)
    }
}

/// Adapter turning a synchronous closure into a [`Factory`].
///
/// ```ignore
/// let factory = FnFactory::new(|key: &String| Ok(Some(key.len())));
/// ```
pub struct FnFactory<F> {
    create: F,
    valid_duration: Option<Duration>,
}

impl<F> FnFactory<F> {
    pub fn new(create: F) -> Self {
        Self {
            create,
            valid_duration: None,
        }
    }

    /// Give every created value a bounded lifetime.
    pub fn with_valid_duration(mut self, duration: Duration) -> Self {
        self.valid_duration = Some(duration);
        self
    }
}

#[async_trait]
impl<K, V, F> Factory<K, V> for FnFactory<F>
where
    K: CacheKey,
    V: CacheValue,
    F: Fn(&K) -> Result<Option<V>, PopulateError> + Send + Sync,
{
    async fn create(&self, key: &K) -> Result<Option<V>, PopulateError> {
        (self.create)(key)
    }

    fn valid_duration(&self) -> Option<Duration> {
        self.valid_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_fn_factory_delegates() {
        let factory = FnFactory::new(|key: &String| Ok::<_, PopulateError>(Some(key.len())));
        assert_eq!(factory.create(&"four".to_string()).await, Ok(Some(4)));
        assert_eq!(Factory::<String, usize>::valid_duration(&factory), None);
    }

    #[tokio::test]
    async fn test_fn_factory_valid_duration() {
        let factory = FnFactory::new(|_: &u32| Ok::<_, PopulateError>(Some("x")))
            .with_valid_duration(Duration::from_secs(5));
        assert_eq!(
            Factory::<u32, &str>::valid_duration(&factory),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_closure_filter() {
        let even = |k: &u32| k % 2 == 0;
        assert!(Filter::accept(&even, &4));
        assert!(!Filter::accept(&even, &5));
    }

    #[test]
    fn test_closure_listener() {
        let seen = Mutex::new(Vec::new());
        let listener = |k: &&str| seen.lock().unwrap().push(k.to_string());
        listener.invalidated(&"a");
        listener.invalidated(&"b");
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }
}
