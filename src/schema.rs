//! Database schema definitions for SQLx.
//!
//! This module contains the job record and the types describing its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default cap on run attempts for a newly enqueued job.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for its `scheduled_at` and a free worker.
    Queued,
    /// Claimed by a worker and executing.
    Running,
    /// Finished successfully. Terminal.
    Success,
    /// Failed permanently or ran out of attempts. Terminal.
    Failed,
    /// Canceled before or during execution. Terminal.
    Canceled,
}

impl JobStatus {
    /// Whether no further transition can leave this state on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }

    /// Lowercase name, as stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// The closed set of job types this engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Provision a remote host over SSH.
    Bootstrap,
    /// Run a configuration-management playbook in a container.
    Playbook,
}

impl JobKind {
    /// Every known kind.
    pub const ALL: [JobKind; 2] = [JobKind::Bootstrap, JobKind::Playbook];

    /// Name stored in the `job_type` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Playbook => "playbook",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Error returned when a `job_type` string names no known [`JobKind`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job type `{0}`")]
pub struct UnknownJobKind(pub String);

impl FromStr for JobKind {
    type Err = UnknownJobKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownJobKind(s.to_string()))
    }
}

/// Represents a job record in the database
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Job {
    /// Unique identifier for the job
    pub id: Uuid,
    /// Type identifier for the job (used for dispatch)
    pub job_type: String,
    /// Opaque payload, JSON-encoded by the enqueuing side
    pub payload: Vec<u8>,
    /// Current lifecycle state
    pub status: JobStatus,
    /// Priority of the job (higher = more important)
    pub priority: i32,
    /// Number of finished attempts that did not succeed
    pub attempts: i32,
    /// Cap on total run attempts
    pub max_attempts: i32,
    /// Earliest time the job may be claimed
    pub scheduled_at: DateTime<Utc>,
    /// Start of the most recent attempt
    pub started_at: Option<DateTime<Utc>>,
    /// Worker currently holding the job
    pub locked_by: Option<String>,
    /// When the current holder claimed the job
    pub locked_at: Option<DateTime<Utc>>,
    /// Truncated message of the most recent failure
    pub last_error: Option<String>,
    /// Set when a running job has been asked to stop
    pub cancel_requested: bool,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last state change
    pub updated_at: DateTime<Utc>,
}

/// Knobs accepted at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Caller-supplied id. A UUIDv7 is generated when absent.
    pub id: Option<Uuid>,
    /// Cap on run attempts, at least 1.
    pub max_attempts: i32,
    /// Earliest claim time. `None` means now.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Higher claims first. `None` uses the payload's default, or 0.
    pub priority: Option<i32>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            id: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_at: None,
            priority: None,
        }
    }
}

impl EnqueueOptions {
    /// Use a caller-supplied id.
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the attempt cap. Values below 1 are raised to 1.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay the first claim until `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// A job about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    /// Id the job will be stored under
    pub id: Uuid,
    /// Type identifier for dispatch
    pub job_type: String,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Priority of the job
    pub priority: i32,
    /// Cap on run attempts
    pub max_attempts: i32,
    /// Earliest claim time, `None` for now
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    /// Build a job from raw parts.
    pub fn new(job_type: impl Into<String>, payload: impl Into<Vec<u8>>, options: EnqueueOptions) -> Self {
        Self {
            id: options.id.unwrap_or_else(Uuid::now_v7),
            job_type: job_type.into(),
            payload: payload.into(),
            priority: options.priority.unwrap_or(0),
            max_attempts: options.max_attempts.max(1),
            scheduled_at: options.scheduled_at,
        }
    }
}

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was queued and is now canceled.
    Canceled,
    /// The job is running; its handler has been asked to stop.
    CancellationRequested,
    /// The job had already reached this terminal state; nothing changed.
    AlreadyFinished(JobStatus),
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok_eq};

    #[test]
    fn job_kind_round_trips_through_its_name() {
        for kind in JobKind::ALL {
            assert_ok_eq!(kind.as_str().parse::<JobKind>(), kind);
        }
    }

    #[test]
    fn unknown_job_kind_is_rejected() {
        let err = assert_err!("bogus".parse::<JobKind>());
        assert_eq!(err.to_string(), "unknown job type `bogus`");
    }

    #[test]
    fn only_finished_states_are_terminal() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        let options = EnqueueOptions::default().max_attempts(0);
        assert_eq!(options.max_attempts, 1);

        let job = NewJob::new(
            "playbook",
            b"{}".to_vec(),
            EnqueueOptions {
                max_attempts: -4,
                ..Default::default()
            },
        );
        assert_eq!(job.max_attempts, 1);
    }

    #[test]
    fn caller_supplied_id_is_kept() {
        let id = Uuid::now_v7();
        let job = NewJob::new("bootstrap", Vec::new(), EnqueueOptions::default().id(id));
        assert_eq!(job.id, id);
    }
}
