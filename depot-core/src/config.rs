//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;
use crate::timeout::Timeout;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_MAX_QUEUED: usize = 256;
pub const DEFAULT_LRU_CAPACITY: usize = 1_000;

/// Capacity of one kernel partition.
///
/// `Bounded(0)` is pass-through mode: the partition never retains anything,
/// so every lookup misses and every install is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PartitionCapacity {
    #[default]
    Unbounded,
    Bounded(usize),
}

impl PartitionCapacity {
    /// Interpret a signed size: non-positive disables the partition.
    pub fn from_signed(size: i64) -> Self {
        if size <= 0 {
            Self::Bounded(0)
        } else {
            Self::Bounded(size as usize)
        }
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self, Self::Bounded(0))
    }

    /// The bound, if any.
    pub fn limit(&self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::Bounded(n) => Some(*n),
        }
    }
}

/// Which kernel implementation backs the depot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KernelKind {
    /// Plain key/entry maps, optionally bounded.
    #[default]
    Map,
    /// Fixed-capacity access-ordered partitions.
    Lru,
}

/// Kernel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub kind: KernelKind,
    pub valid_capacity: PartitionCapacity,
    pub invalid_capacity: PartitionCapacity,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            kind: KernelKind::Map,
            valid_capacity: PartitionCapacity::Unbounded,
            invalid_capacity: PartitionCapacity::Unbounded,
        }
    }
}

impl KernelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// An LRU kernel with both partitions bounded.
    pub fn lru(valid: usize, invalid: usize) -> Self {
        Self {
            kind: KernelKind::Lru,
            valid_capacity: PartitionCapacity::Bounded(valid),
            invalid_capacity: PartitionCapacity::Bounded(invalid),
        }
    }

    pub fn with_kind(mut self, kind: KernelKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_valid_capacity(mut self, capacity: PartitionCapacity) -> Self {
        self.valid_capacity = capacity;
        self
    }

    pub fn with_invalid_capacity(mut self, capacity: PartitionCapacity) -> Self {
        self.invalid_capacity = capacity;
        self
    }

    /// LRU partitions must be bounded and able to hold at least one entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind != KernelKind::Lru {
            return Ok(());
        }
        for (field, capacity) in [
            ("valid_capacity", self.valid_capacity),
            ("invalid_capacity", self.invalid_capacity),
        ] {
            match capacity {
                PartitionCapacity::Unbounded => {
                    return Err(ConfigError::IncompatibleOptions {
                        option_a: "kind = Lru".to_string(),
                        option_b: format!("{} = Unbounded", field),
                    });
                }
                PartitionCapacity::Bounded(0) => {
                    return Err(ConfigError::invalid(
                        field,
                        0,
                        "LRU partitions need a capacity of at least 1",
                    ));
                }
                PartitionCapacity::Bounded(_) => {}
            }
        }
        Ok(())
    }
}

/// Work queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of workers draining the queue.
    pub workers: usize,
    /// Queued (not yet running) jobs beyond which non-priority work is refused.
    pub max_queued: usize,
    /// Jobs that waited longer than this before a worker reached them are
    /// cancelled instead of run.
    pub max_queue_age: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_queued: DEFAULT_MAX_QUEUED,
            max_queue_age: None,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_queued(mut self, max_queued: usize) -> Self {
        self.max_queued = max_queued;
        self
    }

    pub fn with_max_queue_age(mut self, age: Duration) -> Self {
        self.max_queue_age = Some(age);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", 0, "must be at least 1"));
        }
        if self.max_queued == 0 {
            return Err(ConfigError::invalid("max_queued", 0, "must be at least 1"));
        }
        if self.max_queue_age.is_some_and(|age| age.is_zero()) {
            return Err(ConfigError::invalid(
                "max_queue_age",
                "0ms",
                "must be positive when set",
            ));
        }
        Ok(())
    }
}

/// Depot configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DepotConfig {
    pub kernel: KernelConfig,
    pub queue: QueueConfig,
    /// Default wait for `get` calls that do not pass their own.
    pub timeout: Timeout,
    /// Serve a stale entry immediately instead of repopulating.
    pub invalid_no_wait: bool,
}

impl DepotConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kernel(mut self, kernel: KernelConfig) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_invalid_no_wait(mut self, enabled: bool) -> Self {
        self.invalid_no_wait = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kernel.validate()?;
        self.queue.validate()
    }

    /// Create DepotConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `DEPOT_TIMEOUT_MS`: default get timeout; 0 = immediate, negative = forever (default: 1000)
    /// - `DEPOT_INVALID_NO_WAIT`: serve stale entries without repopulating (default: false)
    /// - `DEPOT_WORKERS`: worker count (default: 4)
    /// - `DEPOT_MAX_QUEUED`: queued jobs before load shedding (default: 256)
    /// - `DEPOT_MAX_QUEUE_AGE_MS`: cancel jobs queued longer than this (default: unset)
    /// - `DEPOT_KERNEL`: `map` or `lru` (default: map)
    /// - `DEPOT_VALID_CAPACITY`: valid partition size; non-positive = pass-through (default: unbounded, 1000 for lru)
    /// - `DEPOT_INVALID_CAPACITY`: invalid partition size (same rules)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`DepotConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |name: &str| lookup(name).and_then(|s| s.trim().parse::<i64>().ok());
        let defaults = Self::default();

        let timeout = parsed("DEPOT_TIMEOUT_MS")
            .map(Timeout::from_millis)
            .unwrap_or(defaults.timeout);

        let invalid_no_wait = lookup("DEPOT_INVALID_NO_WAIT")
            .map(|s| s == "true" || s == "1")
            .unwrap_or(defaults.invalid_no_wait);

        let workers = parsed("DEPOT_WORKERS")
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_WORKERS);

        let max_queued = parsed("DEPOT_MAX_QUEUED")
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_QUEUED);

        let max_queue_age = parsed("DEPOT_MAX_QUEUE_AGE_MS")
            .filter(|n| *n > 0)
            .map(|n| Duration::from_millis(n as u64));

        let kind = match lookup("DEPOT_KERNEL").as_deref().map(str::trim) {
            Some(k) if k.eq_ignore_ascii_case("lru") => KernelKind::Lru,
            _ => KernelKind::Map,
        };
        let default_capacity = match kind {
            KernelKind::Map => PartitionCapacity::Unbounded,
            KernelKind::Lru => PartitionCapacity::Bounded(DEFAULT_LRU_CAPACITY),
        };
        let capacity = |name: &str| {
            parsed(name)
                .map(PartitionCapacity::from_signed)
                .unwrap_or(default_capacity)
        };

        Self {
            kernel: KernelConfig {
                kind,
                valid_capacity: capacity("DEPOT_VALID_CAPACITY"),
                invalid_capacity: capacity("DEPOT_INVALID_CAPACITY"),
            },
            queue: QueueConfig {
                workers,
                max_queued,
                max_queue_age,
            },
            timeout,
            invalid_no_wait,
        }
    }
}
