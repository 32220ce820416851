use crate::config::MIN_POLL_INTERVAL;
use crate::errors::StoreError;
use crate::job_registry::{JobError, JobRegistry};
use crate::recorder::OutcomeRecorder;
use crate::schema::Job;
use crate::store::JobStore;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use futures_util::FutureExt;
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

/// Polls the store for claimable jobs and runs at most `capacity` of them at once.
pub(crate) struct WorkerPool {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) job_registry: Arc<JobRegistry>,
    pub(crate) recorder: OutcomeRecorder,
    pub(crate) worker_id: Arc<str>,
    pub(crate) capacity: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) shutdown_when_queue_empty: bool,
}

impl WorkerPool {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Claim and run jobs until `shutdown` is canceled, or until the queue is
    /// empty if `shutdown_when_queue_empty` is set.
    ///
    /// Cancellation stops claiming immediately. Jobs already running receive the
    /// signal through their own token and are awaited before this returns.
    pub(crate) async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.capacity));
        let tasks = TaskTracker::new();

        while !shutdown.is_cancelled() {
            match self.claim_and_spawn(&semaphore, &tasks, &shutdown).await {
                Ok(0) if self.shutdown_when_queue_empty && tasks.is_empty() => {
                    match self.store.queued_count().await {
                        Ok(0) => {
                            debug!("No pending jobs found. Shutting down the worker pool…");
                            break;
                        }
                        Ok(queued) => trace!(queued, "Jobs are queued but not due yet"),
                        Err(error) => error!("Failed to count queued jobs: {error}"),
                    }
                }
                Ok(0) => trace!("No claimable jobs found"),
                Ok(claimed) => debug!(claimed, "Claimed jobs"),
                Err(error) => error!("Failed to claim jobs: {error}"),
            }

            let sleep_duration = self.sleep_duration_with_jitter();
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = sleep(sleep_duration) => {}
            }
        }

        tasks.close();
        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Waiting for running jobs to finish…");
        }
        tasks.wait().await;
    }

    /// Claim as many jobs as there are free slots and start each on its own task.
    ///
    /// Returns the number of jobs claimed.
    async fn claim_and_spawn(
        self: &Arc<Self>,
        semaphore: &Arc<Semaphore>,
        tasks: &TaskTracker,
        shutdown: &CancellationToken,
    ) -> Result<usize, StoreError> {
        let available = semaphore.available_permits();
        if available == 0 {
            trace!("All job slots are busy");
            return Ok(0);
        }

        trace!(available, "Looking for claimable jobs…");
        let jobs = self.store.claim_batch(&self.worker_id, available).await?;
        let claimed = jobs.len();

        for job in jobs {
            // Capacity was measured before claiming and only this loop takes
            // permits, so the wait is bounded by the jobs already running.
            let Ok(permit) = Arc::clone(semaphore).acquire_owned().await else {
                error!(job.id = %job.id, "Job slots were closed while jobs were claimed");
                break;
            };

            let span = info_span!(
                "job",
                job.id = %job.id,
                job.type = %job.job_type,
                job.attempt = job.attempts + 1
            );
            let pool = Arc::clone(self);
            let shutdown = shutdown.clone();
            tasks.spawn(
                async move {
                    pool.execute(job, &shutdown).await;
                    drop(permit);
                }
                .instrument(span),
            );
        }

        Ok(claimed)
    }

    /// Run `job` and store its outcome.
    ///
    /// Failed outcome writes are retried, so the job does not stay `running`
    /// after a transient store error.
    async fn execute(&self, job: Job, shutdown: &CancellationToken) {
        debug!("Running job…");

        let cancel = shutdown.child_token();
        let result = with_sentry_transaction(&job.job_type, || self.run_watched(&job, cancel)).await;

        if let Err(error) = self.recorder.record_until_stored(&job, result, shutdown).await {
            error!("Giving up on recording the job outcome: {error}");
        }
    }

    /// Run the job's handler, cancelling its token once a cancellation request
    /// shows up on the job record.
    async fn run_watched(&self, job: &Job, cancel: CancellationToken) -> Result<(), JobError> {
        let run = AssertUnwindSafe(self.job_registry.dispatch(
            &job.job_type,
            job.payload.clone(),
            cancel.clone(),
        ))
        .catch_unwind()
        .map(|result| {
            result
                .map_err(|e| try_to_extract_panic_info(&*e))
                // `Result::flatten` is still unstable.
                .and_then(std::convert::identity)
        });
        tokio::pin!(run);

        let mut ticker = interval(self.poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = ticker.tick(), if !cancel.is_cancelled() => {
                    match self.store.cancel_requested(job.id).await {
                        Ok(true) => {
                            info!("Cancellation requested, signalling the job");
                            cancel.cancel();
                        }
                        Ok(false) => {}
                        Err(error) => warn!("Failed to check for cancellation: {error}"),
                    }
                }
            }
        }
    }
}
