use crate::coordinator::phase::BatchPhase;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchErrorCode {
    AggregationFailure,
    PolicyRejection,
    CascadeFailure,
    ConfigurationError,
    InvalidBatch,
    InvalidRow,
    ApplyFailure,
    LockTimeout,
    Cancelled,
    InvalidTransition,
    Unavailable,
}

impl BatchErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchErrorCode::AggregationFailure => "aggregation_failure",
            BatchErrorCode::PolicyRejection => "policy_rejection",
            BatchErrorCode::CascadeFailure => "cascade_failure",
            BatchErrorCode::ConfigurationError => "configuration_error",
            BatchErrorCode::InvalidBatch => "invalid_batch",
            BatchErrorCode::InvalidRow => "invalid_row",
            BatchErrorCode::ApplyFailure => "apply_failure",
            BatchErrorCode::LockTimeout => "lock_timeout",
            BatchErrorCode::Cancelled => "cancelled",
            BatchErrorCode::InvalidTransition => "invalid_transition",
            BatchErrorCode::Unavailable => "unavailable",
        }
    }

    /// Whether an error with this code stops the batch.
    pub fn is_fatal(self) -> bool {
        !matches!(
            self,
            BatchErrorCode::PolicyRejection | BatchErrorCode::CascadeFailure
        )
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("aggregation failed: {message}")]
    AggregationFailure { message: String },
    #[error("row {index} rejected: {reason}")]
    PolicyRejection {
        index: usize,
        reason: String,
        rows_applied: usize,
    },
    #[error("cascade {request} failed: {message}")]
    CascadeFailure { request: String, message: String },
    #[error("configuration error: {message}")]
    ConfigurationError { message: String },
    #[error("unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },
    #[error("policy '{policy}' has no aggregate for group {key} and no fallback")]
    MissingGroup { policy: String, key: String },
    #[error("invalid batch: {message}")]
    InvalidBatch { message: String },
    #[error("NOT NULL violation: column '{column}' in table '{table}'")]
    NotNullViolation { table: String, column: String },
    #[error(
        "type mismatch: column '{column}' in table '{table}' expected {expected}, got {actual}"
    )]
    TypeMismatch {
        table: String,
        column: String,
        expected: String,
        actual: String,
    },
    #[error("applying row {index} failed: {message}")]
    ApplyFailure {
        index: usize,
        message: String,
        rows_applied: usize,
    },
    #[error("group lock timeout")]
    LockTimeout,
    #[error("batch cancelled after {rows_applied} applied rows")]
    Cancelled { rows_applied: usize },
    #[error("invalid phase transition {from} -> {to}")]
    InvalidTransition { from: BatchPhase, to: BatchPhase },
    #[error("resource unavailable: {message}")]
    Unavailable { message: String },
}

impl BatchError {
    pub fn code(&self) -> BatchErrorCode {
        match self {
            BatchError::AggregationFailure { .. } => BatchErrorCode::AggregationFailure,
            BatchError::PolicyRejection { .. } => BatchErrorCode::PolicyRejection,
            BatchError::CascadeFailure { .. } => BatchErrorCode::CascadeFailure,
            BatchError::ConfigurationError { .. }
            | BatchError::UnknownColumn { .. }
            | BatchError::MissingGroup { .. } => BatchErrorCode::ConfigurationError,
            BatchError::InvalidBatch { .. } => BatchErrorCode::InvalidBatch,
            BatchError::NotNullViolation { .. } | BatchError::TypeMismatch { .. } => {
                BatchErrorCode::InvalidRow
            }
            BatchError::ApplyFailure { .. } => BatchErrorCode::ApplyFailure,
            BatchError::LockTimeout => BatchErrorCode::LockTimeout,
            BatchError::Cancelled { .. } => BatchErrorCode::Cancelled,
            BatchError::InvalidTransition { .. } => BatchErrorCode::InvalidTransition,
            BatchError::Unavailable { .. } => BatchErrorCode::Unavailable,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Rows the sink had already committed when the batch stopped, if the
    /// error aborted a batch mid-way.
    pub fn rows_applied(&self) -> Option<usize> {
        match self {
            BatchError::PolicyRejection { rows_applied, .. }
            | BatchError::ApplyFailure { rows_applied, .. }
            | BatchError::Cancelled { rows_applied } => Some(*rows_applied),
            _ => None,
        }
    }
}
