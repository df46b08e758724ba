//! Error types shared across the controller.

use uuid::Uuid;

use crate::models::JobStatus;

/// Errors surfaced by registry, manager, cache and backend operations.
///
/// The HTTP layer maps these onto status codes: `Malformed` becomes 400,
/// `NotFound` 404, `BackendStop` 502, `ShuttingDown` 503 and everything else
/// 500. Transient backend errors never escape the manager; they are retried
/// with exponential backoff and either succeed or decay into
/// `BackendPermanent`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {0} already registered")]
    Duplicate(Uuid),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("transient backend error: {0}")]
    BackendTransient(String),

    #[error("permanent backend error: {0}")]
    BackendPermanent(String),

    #[error("could not stop backend job: {0}")]
    BackendStop(String),

    #[error("controller is shutting down")]
    ShuttingDown,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl JobError {
    /// Whether a submission attempt that produced this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::BackendTransient(_))
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
