//! Depot Cache - Self-Populating Two-Tier Cache
//!
//! The engine behind [`Depot`]:
//!
//! - [`kernel`]: the valid/invalid partition pair, as plain maps or LRU caches
//! - [`queue`]: the bounded worker pool that runs population jobs
//! - [`retriever`]: per-key single-flight coordination of those jobs
//! - [`Depot`]: the facade tying them together with the fallback policy
//!
//! Population runs on tokio; a depot must be built inside a runtime.

mod builder;
mod depot;
pub mod kernel;
pub mod queue;
pub mod retriever;
mod stats;

pub use builder::DepotBuilder;
pub use depot::{Depot, SharedFactory};
pub use kernel::{
    kernel_from_config, Installed, Kernel, KernelEvent, KernelEvents, Lookup, LruKernel, MapKernel,
};
pub use queue::{JobTag, QueueStats, ServiceFuture, ServiceOutcome, Transaction, WorkQueue};
pub use retriever::{RetrievalState, Retrieved, Retriever, RetrieverRegistry};
pub use stats::DepotStats;

// Re-export the core types callers need alongside a depot.
pub use depot_core::{
    CacheEntry, CacheKey, CacheValue, ConfigError, DepotConfig, DepotError, DepotResult, Factory,
    Filter, FnFactory, InvalidationListener, KernelConfig, KernelKind, PartitionCapacity,
    Perishable, PopulateError, QueueConfig, QueueError, Timeout,
};
