use crate::backoff::Backoff;
use crate::errors::StoreError;
use crate::job_registry::JobError;
use crate::schema::{Job, JobStatus};
use crate::store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Longest `last_error` stored on a job, in bytes.
pub const MAX_LAST_ERROR_LEN: usize = 4096;

/// Cut `message` to at most [`MAX_LAST_ERROR_LEN`] bytes on a char boundary.
pub(crate) fn truncate_error(message: &str) -> &str {
    if message.len() <= MAX_LAST_ERROR_LEN {
        return message;
    }
    let mut end = MAX_LAST_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

/// Delay between attempts to store an outcome after a store error.
const WRITE_RETRY: Backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));

/// Attempts to store an outcome once the worker is shutting down.
const WRITES_AFTER_SHUTDOWN: u32 = 3;

/// The transition a finished run asks for.
enum Outcome {
    Success,
    Retry(String),
    Failed(String),
}

impl From<Result<(), JobError>> for Outcome {
    fn from(result: Result<(), JobError>) -> Self {
        match result {
            Ok(()) => {
                debug!("Job succeeded");
                Self::Success
            }
            Err(error) => {
                let message = truncate_error(&format!("{error:#}")).to_string();
                if error.is_retryable() {
                    warn!("Failed to run job: {message}");
                    Self::Retry(message)
                } else {
                    warn!("Job failed permanently: {message}");
                    Self::Failed(message)
                }
            }
        }
    }
}

/// Writes the outcome of a job run back onto its record.
///
/// Every transition is conditional on the job still being locked by this
/// recorder's worker, so a finisher that lost its lock changes nothing. A
/// failed run of a job whose cancellation was requested ends up `canceled`.
#[derive(Clone)]
pub struct OutcomeRecorder {
    store: Arc<dyn JobStore>,
    worker_id: Arc<str>,
    backoff: Backoff,
}

impl OutcomeRecorder {
    /// Create a recorder for the jobs claimed by `worker_id`.
    pub fn new(store: Arc<dyn JobStore>, worker_id: impl Into<Arc<str>>, backoff: Backoff) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            backoff,
        }
    }

    /// Record the result of running `job`.
    ///
    /// - success: `success`
    /// - any error after a cancellation request: `canceled`
    /// - retryable error: requeued after backoff, or `failed` once out of attempts
    /// - fatal error: `failed` immediately
    ///
    /// Returns the status the job ended in, or `None` if its lock was lost.
    pub async fn record(&self, job: &Job, result: Result<(), JobError>) -> Result<Option<JobStatus>, StoreError> {
        self.write(job, &Outcome::from(result)).await
    }

    /// [`Self::record`], retrying store errors until the write goes through.
    ///
    /// Once `shutdown` is canceled only [`WRITES_AFTER_SHUTDOWN`] more attempts
    /// are made, and the last error is returned.
    pub(crate) async fn record_until_stored(
        &self,
        job: &Job,
        result: Result<(), JobError>,
        shutdown: &CancellationToken,
    ) -> Result<Option<JobStatus>, StoreError> {
        let outcome = Outcome::from(result);
        let mut failures = 0;
        let mut failures_after_shutdown = 0;

        loop {
            let error = match self.write(job, &outcome).await {
                Ok(status) => return Ok(status),
                Err(error) => error,
            };

            failures += 1;
            if shutdown.is_cancelled() {
                failures_after_shutdown += 1;
                if failures_after_shutdown >= WRITES_AFTER_SHUTDOWN {
                    return Err(error);
                }
            }

            let delay = WRITE_RETRY.delay(failures);
            warn!(failures, "Failed to record job outcome, retrying in {delay:?}: {error}");
            sleep(delay).await;
        }
    }

    async fn write(&self, job: &Job, outcome: &Outcome) -> Result<Option<JobStatus>, StoreError> {
        let worker_id = &*self.worker_id;
        let status = match outcome {
            Outcome::Success => self.store.finish_success(job.id, worker_id).await?,
            Outcome::Retry(message) => {
                self.store
                    .finish_retry(job.id, worker_id, message, &self.backoff)
                    .await?
            }
            Outcome::Failed(message) => self.store.finish_failed(job.id, worker_id, message).await?,
        };

        match status {
            Some(status) => debug!(job.status = %status, "Recorded job outcome"),
            None => warn!("Job lock was lost before its outcome could be recorded"),
        }
        Ok(status)
    }
}
