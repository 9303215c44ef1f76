//! Error types for the consolidation engine.
//!
//! Errors are strongly typed using thiserror so callers can tell a bad
//! configuration (abort the run) from a failed unit of work (record it and
//! move on) from an unavailable advisory collaborator (fall back).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregator::AggregationError;
use crate::graph::NodeId;
use crate::storage::StorageError;

/// Configuration errors. Raised once, at component construction.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{name} {value} is out of range [0.0, 1.0]")]
    ThresholdOutOfRange {
        name: &'static str,
        value: f64,
    },

    #[error("{name} must be greater than zero")]
    NonPositive {
        name: &'static str,
    },

    #[error("at least one detection strategy must be configured")]
    NoStrategies,

    #[error("weight for property '{property}' must be finite and non-negative, got {weight}")]
    InvalidWeight {
        property: String,
        weight: f64,
    },

    #[error("invalid confidence bounds: base {base} exceeds max {max}")]
    InvalidConfidenceBounds {
        base: f64,
        max: f64,
    },

    #[error("failed to parse configuration: {message}")]
    Parse {
        message: String,
    },
}

/// Input validation errors for a single unit of work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("merge requires at least two distinct node ids, got {count}")]
    TooFewNodes {
        count: usize,
    },

    #[error("group is empty")]
    EmptyGroup,

    #[error("kept node {id} is not a member of the merge group")]
    KeptNodeNotInGroup {
        id: NodeId,
    },

    #[error("node {id} was already merged into {into}")]
    AlreadyMerged {
        id: NodeId,
        into: NodeId,
    },

    #[error("resolution for node {id} carries no properties")]
    EmptyResolution {
        id: NodeId,
    },
}

/// Errors raised by the background runtime.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("runtime queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("runtime workers are gone")]
    Disconnected,

    #[error("timed out after {duration_ms}ms waiting for a report")]
    Timeout {
        duration_ms: u64,
    },
}

/// Top-level error type for the engine.
#[derive(Debug, Error)]
pub enum ConsolidationError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("{kind} not found: {id}")]
    NotFound {
        kind: &'static str,
        id: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StorageError),

    #[error("Text aggregation unavailable: {0}")]
    AggregationUnavailable(#[from] AggregationError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl ConsolidationError {
    /// Creates a not-found error for a node.
    #[must_use]
    pub fn node_not_found(id: NodeId) -> Self {
        Self::NotFound {
            kind: "node",
            id: id.to_string(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if a referenced record was absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is a store error.
    #[must_use]
    pub const fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Returns true if the operation may be retried after re-reading state.
    ///
    /// A retried write has an unknown outcome; callers re-read the target's
    /// `merge_history`/`conflicts` before trying again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => matches!(
                e,
                StorageError::VersionConflict { .. }
                    | StorageError::BackendError(_)
                    | StorageError::ConnectionError(_)
            ),
            Self::AggregationUnavailable(_) => true,
            Self::Runtime(e) => matches!(e, RuntimeError::QueueFull { .. }),
            Self::Configuration(_)
            | Self::Validation(_)
            | Self::NotFound { .. }
            | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for engine operations.
pub type ConsolidationResult<T> = Result<T, ConsolidationError>;

/// A unit of work that failed and was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    /// Stage the unit belongs to.
    pub stage: String,
    /// Ids the unit touched, for logs and retries.
    pub unit: String,
    /// Rendered error.
    pub error: String,
    /// Whether re-running the unit may succeed.
    pub retryable: bool,
}

impl UnitFailure {
    /// Records `error` against `unit` in `stage`.
    #[must_use]
    pub fn new(stage: &str, unit: impl Into<String>, error: &ConsolidationError) -> Self {
        Self {
            stage: stage.to_string(),
            unit: unit.into(),
            error: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_threshold() {
        let err = ConfigError::ThresholdOutOfRange {
            name: "similarity_threshold",
            value: 1.5,
        };
        let msg = err.to_string();
        assert!(msg.contains("1.5"));
        assert!(msg.contains("similarity_threshold"));
    }

    #[test]
    fn test_validation_error_too_few() {
        let err = ValidationError::TooFewNodes { count: 1 };
        assert!(err.to_string().contains("at least two"));
    }

    #[test]
    fn test_from_conversions() {
        let err: ConsolidationError = ConfigError::NoStrategies.into();
        assert!(err.is_configuration());
        assert!(!err.is_retryable());

        let err: ConsolidationError = ValidationError::EmptyGroup.into();
        assert!(err.is_validation());

        let err: ConsolidationError = StorageError::NodeNotFound(NodeId::new()).into();
        assert!(err.is_store());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_store_errors() {
        let err: ConsolidationError = StorageError::VersionConflict {
            id: NodeId::new().to_string(),
            expected: 2,
            actual: 3,
        }
        .into();
        assert!(err.is_retryable());

        let err: ConsolidationError = StorageError::BackendError("timeout".to_string()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_queue_full_is_retryable() {
        let err: ConsolidationError = RuntimeError::QueueFull { capacity: 4 }.into();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("capacity 4"));
        let err: ConsolidationError = RuntimeError::Disconnected.into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_found_display() {
        let id = NodeId::new();
        let err = ConsolidationError::node_not_found(id);
        assert!(err.is_not_found());
        assert!(err.to_string().contains(&id.to_string()));
    }
}
