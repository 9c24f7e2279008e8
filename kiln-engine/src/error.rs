//! Error types for the engine

use kiln_client::ConnectionError;
use kiln_core::{JobId, ValidationError};
use thiserror::Error;

/// Coarse classification of a [`DispatchError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    BatchTooLarge,
    EmptyBatch,
    UnknownJob,
    Unavailable,
}

/// Errors returned to the front end by the dispatcher
///
/// A rejected submission never creates a job record.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Request parameters failed validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// One entry of a batch failed validation
    #[error("batch entry {index} is invalid: {source}")]
    InvalidBatchEntry {
        index: usize,
        #[source]
        source: ValidationError,
    },

    #[error("batch of {count} requests exceeds the limit of {max}")]
    BatchTooLarge { count: usize, max: usize },

    #[error("batch must contain at least one request")]
    EmptyBatch,

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    /// Backend session is down
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::InvalidBatchEntry { .. } => ErrorKind::Validation,
            Self::BatchTooLarge { .. } => ErrorKind::BatchTooLarge,
            Self::EmptyBatch => ErrorKind::EmptyBatch,
            Self::UnknownJob(_) => ErrorKind::UnknownJob,
            Self::Connection(_) => ErrorKind::Unavailable,
        }
    }

    /// Check if the request was rejected for bad parameters
    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }

    /// Check if this error is a "batch too large" rejection
    pub fn is_batch_too_large(&self) -> bool {
        matches!(self, Self::BatchTooLarge { .. })
    }

    /// Check if this error refers to a job the table does not know
    pub fn is_unknown_job(&self) -> bool {
        matches!(self, Self::UnknownJob(_))
    }
}

/// An event the lifecycle refuses to apply
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("progress fraction is not a finite number")]
    NonFiniteProgress,
}
