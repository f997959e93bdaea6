//! Error taxonomy shared by the store, the actors and the public API.

use thiserror::Error;

use crate::{JobId, JobState};

/// Errors raised at the ordered store boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Transient infrastructure failure. Callers retry with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The id is not where the caller expected it to be.
    #[error("job {0} not found in store")]
    NotFound(JobId),
}

impl StoreError {
    /// Wrap any backend error as a transient failure.
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }

    /// Whether the operation may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Errors returned by the queue API.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("handler already registered for job type: {0}")]
    AlreadyRegistered(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => QueueError::StoreUnavailable(msg),
            StoreError::NotFound(id) => QueueError::NotFound(id),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid queue config: {0}")]
    Invalid(String),

    #[error("invalid value {value:?} for {key}")]
    Env { key: String, value: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a processing attempt did not succeed.
///
/// The `Display` form is what gets recorded in `Job::last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("{0}")]
    Handler(String),

    #[error("handler exceeded its lease deadline")]
    DeadlineExceeded,

    #[error("lease expired")]
    LeaseExpired,

    #[error("no handler registered for job type: {0}")]
    NoHandler(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}
