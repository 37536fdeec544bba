//! Depot Test Utilities
//!
//! Shared test infrastructure for the Depot workspace:
//! - Instrumented factories (counting, gated, cancelling, failing, panicking)
//! - A perishable value type and a recording invalidation listener
//! - Proptest generators for keys and depot operation sequences
//! - Test tracing setup

pub use depot_core::{
    CacheEntry, CacheKey, CacheValue, DepotConfig, Factory, InvalidationListener, KernelConfig,
    Perishable, PopulateError, QueueConfig, Timeout,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// TRACING
// ============================================================================

static TRACING: once_cell::sync::OnceCell<()> = once_cell::sync::OnceCell::new();

/// Install a test-writer subscriber filtered by `RUST_LOG` (default `warn`).
/// Safe to call from every test.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("depot_cache=warn,warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// FACTORIES
// ============================================================================

type Produce<K, V> = Box<dyn Fn(&K) -> Option<V> + Send + Sync>;

/// Factory that counts its invocations, optionally after a delay.
pub struct CountingFactory<K, V> {
    produce: Produce<K, V>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    valid_duration: Option<Duration>,
}

impl<K, V> CountingFactory<K, V> {
    pub fn new(produce: impl Fn(&K) -> Option<V> + Send + Sync + 'static) -> Self {
        Self {
            produce: Box::new(produce),
            calls: AtomicUsize::new(0),
            delay: None,
            valid_duration: None,
        }
    }

    /// Sleep this long inside every `create`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_valid_duration(mut self, duration: Duration) -> Self {
        self.valid_duration = Some(duration);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<K: CacheKey, V: CacheValue> CountingFactory<K, V> {
    /// Always produce `value`.
    pub fn constant(value: V) -> Self {
        Self::new(move |_| Some(value.clone()))
    }
}

#[async_trait]
impl<K, V> Factory<K, V> for CountingFactory<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    async fn create(&self, key: &K) -> Result<Option<V>, PopulateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok((self.produce)(key))
    }

    fn valid_duration(&self) -> Option<Duration> {
        self.valid_duration
    }
}

/// Factory whose `create` blocks until the gate is opened.
///
/// Lets a test hold a worker busy and observe exactly when service starts.
pub struct GatedFactory<K, V> {
    produce: Produce<K, V>,
    gate: watch::Sender<bool>,
    started: watch::Sender<usize>,
}

impl<K, V> GatedFactory<K, V> {
    pub fn new(produce: impl Fn(&K) -> Option<V> + Send + Sync + 'static) -> Self {
        let (gate, _) = watch::channel(false);
        let (started, _) = watch::channel(0);
        Self {
            produce: Box::new(produce),
            gate,
            started,
        }
    }

    /// Let every pending and future `create` finish.
    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    /// Number of `create` calls that have begun.
    pub fn started(&self) -> usize {
        *self.started.borrow()
    }

    /// Wait until at least `count` calls have begun.
    pub async fn wait_started(&self, count: usize) {
        let mut rx = self.started.subscribe();
        let _ = rx.wait_for(|started| *started >= count).await;
    }
}

#[async_trait]
impl<K, V> Factory<K, V> for GatedFactory<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    async fn create(&self, key: &K) -> Result<Option<V>, PopulateError> {
        let mut gate = self.gate.subscribe();
        self.started.send_modify(|started| *started += 1);
        let _ = gate.wait_for(|open| *open).await;
        Ok((self.produce)(key))
    }
}

/// Factory that always reports cancellation.
#[derive(Debug, Default)]
pub struct CancellingFactory {
    calls: AtomicUsize,
}

impl CancellingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<K, V> Factory<K, V> for CancellingFactory
where
    K: CacheKey,
    V: CacheValue,
{
    async fn create(&self, _key: &K) -> Result<Option<V>, PopulateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PopulateError::Cancelled)
    }
}

/// Factory that always fails with `reason`.
#[derive(Debug)]
pub struct FailingFactory {
    reason: String,
    calls: AtomicUsize,
}

impl FailingFactory {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<K, V> Factory<K, V> for FailingFactory
where
    K: CacheKey,
    V: CacheValue,
{
    async fn create(&self, _key: &K) -> Result<Option<V>, PopulateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PopulateError::failed(self.reason.clone()))
    }
}

/// Factory that panics inside `create`.
#[derive(Debug, Default)]
pub struct PanickingFactory;

#[async_trait]
impl<K, V> Factory<K, V> for PanickingFactory
where
    K: CacheKey,
    V: CacheValue,
{
    async fn create(&self, key: &K) -> Result<Option<V>, PopulateError> {
        panic!("factory panicked for {:?}", key);
    }
}

// ============================================================================
// VALUES AND LISTENERS
// ============================================================================

/// A value that may declare itself stale on creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PerishableValue {
    pub payload: u32,
    pub valid: bool,
}

impl PerishableValue {
    pub fn fresh(payload: u32) -> Self {
        Self {
            payload,
            valid: true,
        }
    }

    pub fn perished(payload: u32) -> Self {
        Self {
            payload,
            valid: false,
        }
    }
}

impl Perishable for PerishableValue {
    fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Listener that records every key it is notified with, in order.
#[derive(Debug)]
pub struct RecordingListener<K> {
    keys: Mutex<Vec<K>>,
}

impl<K> Default for RecordingListener<K> {
    fn default() -> Self {
        Self {
            keys: Mutex::new(Vec::new()),
        }
    }
}

impl<K: Clone> RecordingListener<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<K> {
        self.keys.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn clear(&self) {
        self.keys.lock().clear();
    }
}

impl<K: Clone + Send + Sync> InvalidationListener<K> for RecordingListener<K> {
    fn invalidated(&self, key: &K) {
        self.keys.lock().push(key.clone());
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for depot keys, values and operation sequences.

    use proptest::prelude::*;

    /// One mutation applied to a depot in a property test.
    #[derive(Debug, Clone)]
    pub enum DepotOp {
        Put(u8, Option<u16>),
        Remove(u8),
        Invalidate(u8),
        /// Invalidate keys with the given remainder mod 3.
        InvalidateMatching(u8),
        /// Remove keys with the given remainder mod 3.
        RemoveMatching(u8),
        InvalidateAll,
        Evict,
        Clear,
    }

    /// Keys from a small space so that operations collide.
    pub fn arb_key() -> impl Strategy<Value = u8> {
        0u8..16
    }

    /// Values including the cached absence.
    pub fn arb_value() -> impl Strategy<Value = Option<u16>> {
        prop_oneof![
            1 => Just(None),
            4 => any::<u16>().prop_map(Some),
        ]
    }

    pub fn arb_op() -> impl Strategy<Value = DepotOp> {
        prop_oneof![
            6 => (arb_key(), arb_value()).prop_map(|(k, v)| DepotOp::Put(k, v)),
            2 => arb_key().prop_map(DepotOp::Remove),
            3 => arb_key().prop_map(DepotOp::Invalidate),
            1 => (0u8..3).prop_map(DepotOp::InvalidateMatching),
            1 => (0u8..3).prop_map(DepotOp::RemoveMatching),
            1 => Just(DepotOp::InvalidateAll),
            1 => Just(DepotOp::Evict),
            1 => Just(DepotOp::Clear),
        ]
    }

    pub fn arb_ops(max: usize) -> impl Strategy<Value = Vec<DepotOp>> {
        proptest::collection::vec(arb_op(), 0..max)
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over depot partition contents.

    use std::collections::HashSet;
    use std::fmt::Debug;
    use std::hash::Hash;

    /// Assert no key appears in both partitions.
    pub fn assert_partitions_disjoint<K: Eq + Hash + Debug>(valid: &[K], invalid: &[K]) {
        let valid: HashSet<&K> = valid.iter().collect();
        let overlap: Vec<&K> = invalid.iter().filter(|k| valid.contains(k)).collect();
        assert!(
            overlap.is_empty(),
            "keys present in both partitions: {:?}",
            overlap
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counting_factory_counts() {
        let factory = CountingFactory::<u32, u32>::new(|k| Some(k * 2));
        assert_eq!(factory.create(&4).await, Ok(Some(8)));
        assert_eq!(factory.create(&5).await, Ok(Some(10)));
        assert_eq!(factory.calls(), 2);
    }

    #[tokio::test]
    async fn test_gated_factory_waits_for_gate() {
        use std::sync::Arc;

        let factory = Arc::new(GatedFactory::<u32, u32>::new(|k| Some(*k)));
        let task = {
            let factory = Arc::clone(&factory);
            tokio::spawn(async move { factory.create(&3).await })
        };
        factory.wait_started(1).await;
        assert!(!task.is_finished());
        factory.open();
        assert_eq!(task.await.expect("task"), Ok(Some(3)));
    }

    #[test]
    fn test_recording_listener() {
        let listener = RecordingListener::new();
        listener.invalidated(&"a");
        listener.invalidated(&"b");
        assert_eq!(listener.keys(), vec!["a", "b"]);
        assert_eq!(listener.count(), 2);
    }

    #[test]
    fn test_perishable_value() {
        assert!(PerishableValue::fresh(1).is_valid());
        assert!(!PerishableValue::perished(1).is_valid());
    }

    #[test]
    #[should_panic(expected = "both partitions")]
    fn test_assert_partitions_disjoint_detects_overlap() {
        assertions::assert_partitions_disjoint(&[1, 2], &[2, 3]);
    }
}
