//! Depot Core - Entry Model and Capabilities
//!
//! Leaf types shared by every Depot crate: the [`CacheEntry`] wrapper, the
//! capability traits a depot is parameterised over, the error taxonomy and
//! configuration. This crate contains no concurrency machinery.

use chrono::{DateTime, Utc};

pub mod config;
pub mod entry;
pub mod error;
pub mod timeout;
pub mod traits;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use config::{
    DepotConfig, KernelConfig, KernelKind, PartitionCapacity, QueueConfig, DEFAULT_LRU_CAPACITY,
    DEFAULT_MAX_QUEUED, DEFAULT_WORKERS,
};
pub use entry::{deadline_after, CacheEntry};
pub use error::{ConfigError, DepotError, DepotResult, PopulateError, QueueError};
pub use timeout::Timeout;
pub use traits::{
    CacheKey, CacheValue, Factory, Filter, FnFactory, InvalidationListener, Perishable,
};
