//! Error types for Depot operations

use thiserror::Error;

/// Configuration errors, raised synchronously when a depot, kernel or work
/// queue is constructed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::InvalidValue`].
    pub fn invalid(
        field: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Admission outcome of a work queue that refused a job.
///
/// Refusal is load shedding, not a failure: the refused job has already been
/// cancelled by the time the caller sees this.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Work queue full ({capacity} jobs queued)")]
    Full { capacity: usize },

    #[error("Work queue shut down")]
    ShutDown,

    #[error("No async runtime available to start workers")]
    NoRuntime,
}

/// What a factory reports instead of a value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PopulateError {
    /// The factory gave up (timeout, interruption). Degrades to "no value".
    #[error("Population cancelled")]
    Cancelled,

    /// The factory hit a genuine fault.
    #[error("Population failed: {reason}")]
    Failed { reason: String },
}

impl PopulateError {
    /// Shorthand for [`PopulateError::Failed`].
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Master error type for all Depot errors.
#[derive(Debug, Clone, Error)]
pub enum DepotError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Population failed: {reason}")]
    PopulationFailed { reason: String },
}

/// Result type alias for Depot operations.
pub type DepotResult<T> = Result<T, DepotError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::invalid("workers", 0, "must be at least 1");
        let msg = format!("{}", err);
        assert!(msg.contains("workers"));
        assert!(msg.contains('0'));
        assert!(msg.contains("must be at least 1"));
    }

    #[test]
    fn test_queue_error_display_full() {
        let err = QueueError::Full { capacity: 16 };
        let msg = format!("{}", err);
        assert!(msg.contains("full"));
        assert!(msg.contains("16"));
    }

    #[test]
    fn test_populate_error_failed_reason() {
        let err = PopulateError::failed("backend unreachable");
        assert_eq!(
            err,
            PopulateError::Failed {
                reason: "backend unreachable".to_string()
            }
        );
        assert!(format!("{}", err).contains("backend unreachable"));
    }

    #[test]
    fn test_depot_error_from_variants() {
        let config = DepotError::from(ConfigError::MissingRequired {
            field: "factory".to_string(),
        });
        assert!(matches!(config, DepotError::Config(_)));

        let queue = DepotError::from(QueueError::ShutDown);
        assert!(matches!(queue, DepotError::Queue(_)));
    }
}
