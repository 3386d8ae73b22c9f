//! Error types for parallel execution
//!
//! Errors come in two flavours: structural failures returned to the caller
//! (`CacheError`, `ExecutionError`, `CommitError`, `ConfigError`) and
//! per-job outcomes recorded as data on a job's result (`JobError`).

use primitive_types::U256;
use thiserror::Error;

use super::value_objects::{SequenceId, TxIndex};

/// Failures of the typed value algorithms.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// Accumulated delta leaves the declared bounds
    #[error("Value leaves bounds [{min}, {max}]")]
    BoundsExceeded { min: U256, max: U256 },

    /// Lower bound above upper bound
    #[error("Invalid bounds: min {min} > max {max}")]
    InvalidBounds { min: U256, max: U256 },

    /// Initial value outside of its bounds
    #[error("Initial value {value} outside bounds [{min}, {max}]")]
    OutOfBounds { value: U256, min: U256, max: U256 },

    /// Delta magnitude no longer fits in 256 bits
    #[error("Delta overflows 256 bits")]
    Overflow,

    /// Delta applied to a value of another kind
    #[error("Kind mismatch: expected {expected}, found {found}")]
    KindMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

/// Errors surfaced synchronously by the write cache.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Write below a container that is not visible in the cascade
    #[error("Parent path missing for {path}")]
    ParentPathMissing { path: String },

    /// Commutative write would leave the accumulator bounds
    #[error("Bounds violation at {path}: [{min}, {max}]")]
    BoundsViolation { path: String, min: U256, max: U256 },

    /// Value kind does not fit the path or the pending delta
    #[error("Type mismatch at {path}: {reason}")]
    TypeMismatch { path: String, reason: String },

    /// Layer handle was released or never allocated
    #[error("Unknown cache layer {0}")]
    UnknownLayer(usize),

    /// Layer still has live children
    #[error("Cache layer {layer} still has {children} live children")]
    LayerInUse { layer: usize, children: usize },

    /// Nested frames or generations exceed the configured depth
    #[error("Nesting depth exceeded: max {max}")]
    NestingTooDeep { max: usize },

    /// Broken internal assumption of a value algorithm
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl CacheError {
    /// Attach a path to a value-level failure.
    pub fn at(path: &str, err: ValueError) -> Self {
        match err {
            ValueError::BoundsExceeded { min, max } => Self::BoundsViolation {
                path: path.to_string(),
                min,
                max,
            },
            ValueError::KindMismatch { .. } => Self::TypeMismatch {
                path: path.to_string(),
                reason: err.to_string(),
            },
            other => Self::InvariantViolation(format!("{path}: {other}")),
        }
    }
}

/// Opaque outcome of the interpreter contract.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InterpreterError {
    /// Rejected before execution started (no receipt)
    #[error("Prevalidation failed: {0}")]
    Prevalidation(String),

    /// Execution ran and reverted
    #[error("Execution reverted: {0}")]
    Reverted(String),

    /// Anything else the interpreter reports
    #[error("Interpreter fault: {0}")]
    Fault(String),
}

/// Per-job error, stored on the job result rather than propagated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Assigned by arbitration from the first conflicting job onward
    #[error("Access conflict")]
    AccessConflict,

    /// Interpreter reported a failure
    #[error(transparent)]
    Interpreter(#[from] InterpreterError),

    /// Transitions could not be merged without leaving bounds
    #[error("Bounds violation at {path}")]
    BoundsViolation { path: String },

    /// Value algorithm hit a broken invariant
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl From<CacheError> for JobError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::BoundsViolation { path, .. } => Self::BoundsViolation { path },
            other => Self::InvariantViolation(other.to_string()),
        }
    }
}

/// Structural failures of sequence, generation and service execution.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Job already carries a result
    #[error("Job {tx_index} already executed")]
    AlreadyExecuted { tx_index: TxIndex },

    /// Sequence left the Created state
    #[error("Job sequence {id} already ran")]
    SequenceAlreadyRun { id: SequenceId },

    /// Cache contract failure
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Commit sink rejected the transitions
    #[error("Commit failed: {0}")]
    Commit(#[from] CommitError),

    /// Transitions could not be encoded for hashing
    #[error("Encoding failed: {0}")]
    Encoding(String),

    /// Blocking worker task did not complete
    #[error("Worker task failed: {0}")]
    WorkerFailed(String),
}

/// Errors from a commit sink.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommitError {
    /// Transition could not be applied to the stored value
    #[error("Transition at {path} rejected: {reason}")]
    Rejected { path: String, reason: String },
}

/// Configuration validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Field must be strictly positive
    #[error("Invalid configuration: {field} must be at least 1")]
    Zero { field: &'static str },

    /// Environment variable could not be parsed
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::ParentPathMissing {
            path: "/accounts/0x01/balance".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Parent path missing for /accounts/0x01/balance"
        );
    }

    #[test]
    fn test_value_error_gets_path() {
        let err = CacheError::at(
            "/pool/reserve",
            ValueError::BoundsExceeded {
                min: U256::zero(),
                max: U256::from(100),
            },
        );
        assert_eq!(
            err,
            CacheError::BoundsViolation {
                path: "/pool/reserve".to_string(),
                min: U256::zero(),
                max: U256::from(100),
            }
        );
    }

    #[test]
    fn test_cache_error_becomes_job_error() {
        let err: JobError = CacheError::BoundsViolation {
            path: "/x".to_string(),
            min: U256::zero(),
            max: U256::one(),
        }
        .into();
        assert_eq!(
            err,
            JobError::BoundsViolation {
                path: "/x".to_string()
            }
        );

        let err: JobError = CacheError::UnknownLayer(3).into();
        assert!(matches!(err, JobError::InvariantViolation(_)));
    }

    #[test]
    fn test_interpreter_error_is_transparent() {
        let err: JobError = InterpreterError::Reverted("out of gas".to_string()).into();
        assert_eq!(err.to_string(), "Execution reverted: out of gas");
    }
}
