//! How long a caller is willing to wait for a population attempt.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wait bound for a cache read that misses.
///
/// `Forever` is the only unbounded wait in the system. A caller asking for it
/// has opted out of load shedding, so its population job is admitted to the
/// work queue with priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeout {
    /// Do not wait; return whatever is already known.
    Immediate,
    /// Wait at most this long.
    After(Duration),
    /// Wait until the population attempt settles.
    Forever,
}

impl Timeout {
    /// Interpret a millisecond count: `0` is immediate, negative is forever.
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            0 => Self::Immediate,
            m if m < 0 => Self::Forever,
            m => Self::After(Duration::from_millis(m as u64)),
        }
    }

    /// Inverse of [`Timeout::from_millis`].
    pub fn as_millis(&self) -> i64 {
        match self {
            Self::Immediate => 0,
            Self::After(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
            Self::Forever => -1,
        }
    }

    /// Whether a job dispatched on behalf of this caller bypasses admission control.
    pub fn is_priority(&self) -> bool {
        matches!(self, Self::Forever)
    }

    /// The bounded wait, if any. `Immediate` reports `Duration::ZERO`.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Immediate => Some(Duration::ZERO),
            Self::After(d) => Some(*d),
            Self::Forever => None,
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Self::After(Duration::from_secs(1))
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Self::Immediate
        } else {
            Self::After(d)
        }
    }
}
