use crate::schema::JobStatus;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by a [`JobStore`](crate::JobStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing database failed.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Schema migrations could not be applied.
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// No job exists with this id.
    #[error("job {0} not found")]
    NotFound(Uuid),

    /// The job is in a state the operation does not apply to.
    #[error("job {id} is {status}")]
    InvalidState {
        /// The job
        id: Uuid,
        /// Its current state
        status: JobStatus,
    },

    /// A failed job has used all of its attempts and was not reset.
    #[error("job {id} has used {attempts} of {max_attempts} attempts")]
    AttemptsExhausted {
        /// The job
        id: Uuid,
        /// Attempts made
        attempts: i32,
        /// Attempt cap
        max_attempts: i32,
    },
}

/// Errors that can occur when enqueueing a job.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The payload could not be encoded.
    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),

    /// The store rejected the insert.
    #[error(transparent)]
    StoreError(#[from] StoreError),
}
