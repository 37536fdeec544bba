//! Depot construction.

use depot_core::{
    CacheKey, CacheValue, DepotConfig, DepotResult, Factory, InvalidationListener, KernelConfig,
    Perishable, QueueConfig, Timeout,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::debug;

use crate::depot::{Depot, DepotInner, SharedFactory, ValidityProbe};
use crate::kernel::{kernel_from_config, Kernel};
use crate::queue::WorkQueue;
use crate::retriever::RetrieverRegistry;
use crate::stats::DepotCounters;

/// Builder for [`Depot`].
///
/// `build` starts the work queue, so it must run inside a tokio runtime.
pub struct DepotBuilder<K: CacheKey, V: CacheValue> {
    config: DepotConfig,
    factory: Option<SharedFactory<K, V>>,
    kernel: Option<Arc<dyn Kernel<K, V>>>,
    validity: Option<ValidityProbe<V>>,
    listeners: Vec<Arc<dyn InvalidationListener<K>>>,
}

impl<K: CacheKey, V: CacheValue> Default for DepotBuilder<K, V> {
    fn default() -> Self {
        Self {
            config: DepotConfig::default(),
            factory: None,
            kernel: None,
            validity: None,
            listeners: Vec::new(),
        }
    }
}

impl<K: CacheKey, V: CacheValue> DepotBuilder<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: DepotConfig) -> Self {
        self.config = config;
        self
    }

    /// Default factory used by [`Depot::get`].
    pub fn factory<F>(self, factory: F) -> Self
    where
        F: Factory<K, V> + 'static,
    {
        self.shared_factory(Arc::new(factory))
    }

    pub fn shared_factory(mut self, factory: SharedFactory<K, V>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Use a custom kernel instead of one built from [`KernelConfig`].
    pub fn kernel(mut self, kernel: Arc<dyn Kernel<K, V>>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    pub fn kernel_config(mut self, kernel: KernelConfig) -> Self {
        self.config.kernel = kernel;
        self
    }

    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.config.queue = queue;
        self
    }

    pub fn timeout(mut self, timeout: Timeout) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn invalid_no_wait(mut self, enabled: bool) -> Self {
        self.config.invalid_no_wait = enabled;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn InvalidationListener<K>>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> DepotResult<Depot<K, V>> {
        let kernel = match self.kernel {
            Some(kernel) => {
                self.config.queue.validate()?;
                kernel
            }
            None => {
                self.config.validate()?;
                kernel_from_config(&self.config.kernel)?
            }
        };
        let queue = WorkQueue::start(&self.config.queue)?;
        let events = kernel.take_events();

        debug!(
            kind = ?self.config.kernel.kind,
            timeout_ms = self.config.timeout.as_millis(),
            invalid_no_wait = self.config.invalid_no_wait,
            has_factory = self.factory.is_some(),
            "Depot built"
        );

        Ok(Depot::from_inner(DepotInner {
            kernel,
            factory: self.factory,
            queue,
            retrievers: RetrieverRegistry::new(),
            timeout: self.config.timeout,
            invalid_no_wait: self.config.invalid_no_wait,
            validity: self.validity,
            listeners: RwLock::new(self.listeners),
            events: Mutex::new(events),
            counters: DepotCounters::default(),
        }))
    }
}

impl<K: CacheKey, V: CacheValue + Perishable> DepotBuilder<K, V> {
    /// Check every produced value's [`Perishable::is_valid`] and keep stale
    /// ones out of the valid partition.
    pub fn perishable(mut self) -> Self {
        let probe: ValidityProbe<V> = Arc::new(|value: &V| value.is_valid());
        self.validity = Some(probe);
        self
    }
}
