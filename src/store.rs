//! The storage seam of the engine.
//!
//! Everything that reads or mutates job records goes through [`JobStore`], so the
//! claimer, the worker pool and the outcome recorder never depend on how a
//! backend implements "skip rows another claimant holds".

use crate::backoff::Backoff;
use crate::errors::StoreError;
use crate::schema::{CancelOutcome, Job, JobStatus, NewJob};
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Durable storage for job records.
///
/// Implementations must make [`claim_batch`](Self::claim_batch) atomic with
/// respect to concurrent callers, including callers in other processes: two
/// overlapping claims return disjoint sets and neither blocks on the other.
///
/// The `finish_*` transitions only apply while the job is `running` and locked
/// by `worker_id`. They return the status the job ended up in, or `None` when
/// the lock no longer belongs to `worker_id` and nothing was written.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a new `queued` job and return its id.
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, StoreError>;

    /// Load a single job.
    async fn find(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Atomically claim up to `limit` eligible jobs for `worker_id`.
    ///
    /// Eligible means `queued` with `scheduled_at <= now`. Jobs are returned in
    /// claim order: `priority DESC, scheduled_at ASC`.
    async fn claim_batch(&self, worker_id: &str, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Mark a running job as successful.
    async fn finish_success(&self, id: Uuid, worker_id: &str) -> Result<Option<JobStatus>, StoreError>;

    /// Count a failed attempt and requeue the job after `backoff`, or fail it
    /// when no attempts remain.
    ///
    /// A job whose cancellation was requested is marked `canceled` instead,
    /// without counting an attempt.
    async fn finish_retry(
        &self,
        id: Uuid,
        worker_id: &str,
        last_error: &str,
        backoff: &Backoff,
    ) -> Result<Option<JobStatus>, StoreError>;

    /// Count a failed attempt and fail the job permanently, or mark it
    /// `canceled` if its cancellation was requested.
    async fn finish_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        last_error: &str,
    ) -> Result<Option<JobStatus>, StoreError>;

    /// Mark a running job whose cancellation was observed as canceled.
    async fn finish_canceled(
        &self,
        id: Uuid,
        worker_id: &str,
        last_error: Option<&str>,
    ) -> Result<Option<JobStatus>, StoreError>;

    /// Cancel a queued job, or flag a running one for cancellation.
    async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, StoreError>;

    /// Make a queued or failed job claimable immediately.
    ///
    /// A failed job without attempts left is only requeued when
    /// `reset_attempts` is set, which also resets its attempt counter.
    async fn retry_now(&self, id: Uuid, reset_attempts: bool) -> Result<(), StoreError>;

    /// Whether cancellation was requested for a running job.
    async fn cancel_requested(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Number of `queued` jobs, whether or not they are due yet.
    async fn queued_count(&self) -> Result<i64, StoreError>;

    /// Release jobs whose lock is older than `older_than`.
    ///
    /// Each such job counts a failed attempt and goes back to `queued` (due
    /// immediately), to `failed` when out of attempts, or to `canceled` when its
    /// cancellation was requested. Returns the number of jobs released.
    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, StoreError>;
}
