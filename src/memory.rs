use crate::backoff::Backoff;
use crate::errors::StoreError;
use crate::schema::{CancelOutcome, Job, JobStatus, NewJob};
use crate::store::JobStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

/// [`JobStore`] kept in process memory.
///
/// Every operation runs under one mutex, which stands in for the row locks of a
/// database: claims are atomic and disjoint across all clones of the store.
/// Useful for tests, demos and single-process deployments; nothing survives a
/// restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    jobs: Arc<Mutex<HashMap<Uuid, Job>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All jobs, oldest first.
    pub async fn jobs(&self) -> Vec<Job> {
        let jobs = self.jobs.lock().await;
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by_key(|job| (job.created_at, job.id));
        all
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn release_lock(job: &mut Job, status: JobStatus, now: DateTime<Utc>) {
    job.status = status;
    job.locked_by = None;
    job.locked_at = None;
    job.updated_at = now;
}

fn held_by<'a>(jobs: &'a mut HashMap<Uuid, Job>, id: Uuid, worker_id: &str) -> Option<&'a mut Job> {
    jobs.get_mut(&id)
        .filter(|job| job.status == JobStatus::Running && job.locked_by.as_deref() == Some(worker_id))
}

#[async_trait]
impl JobStore for MemoryStore {
    #[instrument(skip_all, err, fields(job.type = %job.job_type))]
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;

        jobs.insert(
            job.id,
            Job {
                id: job.id,
                job_type: job.job_type,
                payload: job.payload,
                status: JobStatus::Queued,
                priority: job.priority,
                attempts: 0,
                max_attempts: job.max_attempts.max(1),
                scheduled_at: job.scheduled_at.unwrap_or(now),
                started_at: None,
                locked_by: None,
                locked_at: None,
                last_error: None,
                cancel_requested: false,
                created_at: now,
                updated_at: now,
            },
        );

        Ok(job.id)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn claim_batch(&self, worker_id: &str, limit: usize) -> Result<Vec<Job>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;

        let mut eligible: Vec<&mut Job> = jobs
            .values_mut()
            .filter(|job| job.status == JobStatus::Queued && job.scheduled_at <= now)
            .collect();
        eligible.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_at.cmp(&b.scheduled_at))
        });

        Ok(eligible
            .into_iter()
            .take(limit)
            .map(|job| {
                job.status = JobStatus::Running;
                job.locked_by = Some(worker_id.to_string());
                job.locked_at = Some(now);
                job.started_at = Some(now);
                job.cancel_requested = false;
                job.updated_at = now;
                job.clone()
            })
            .collect())
    }

    async fn finish_success(&self, id: Uuid, worker_id: &str) -> Result<Option<JobStatus>, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = held_by(&mut jobs, id, worker_id) else {
            return Ok(None);
        };

        job.cancel_requested = false;
        release_lock(job, JobStatus::Success, Utc::now());
        Ok(Some(job.status))
    }

    async fn finish_retry(
        &self,
        id: Uuid,
        worker_id: &str,
        last_error: &str,
        backoff: &Backoff,
    ) -> Result<Option<JobStatus>, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = held_by(&mut jobs, id, worker_id) else {
            return Ok(None);
        };

        let now = Utc::now();
        job.last_error = Some(last_error.to_string());
        if job.cancel_requested {
            release_lock(job, JobStatus::Canceled, now);
            return Ok(Some(job.status));
        }

        job.attempts = (job.attempts + 1).min(job.max_attempts);
        if job.attempts < job.max_attempts {
            job.scheduled_at = after(now, backoff.delay_for(job.attempts));
            release_lock(job, JobStatus::Queued, now);
        } else {
            release_lock(job, JobStatus::Failed, now);
        }
        Ok(Some(job.status))
    }

    async fn finish_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        last_error: &str,
    ) -> Result<Option<JobStatus>, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = held_by(&mut jobs, id, worker_id) else {
            return Ok(None);
        };

        job.last_error = Some(last_error.to_string());
        if job.cancel_requested {
            release_lock(job, JobStatus::Canceled, Utc::now());
            return Ok(Some(job.status));
        }

        job.attempts = (job.attempts + 1).min(job.max_attempts);
        release_lock(job, JobStatus::Failed, Utc::now());
        Ok(Some(job.status))
    }

    async fn finish_canceled(
        &self,
        id: Uuid,
        worker_id: &str,
        last_error: Option<&str>,
    ) -> Result<Option<JobStatus>, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = held_by(&mut jobs, id, worker_id) else {
            return Ok(None);
        };

        if let Some(message) = last_error {
            job.last_error = Some(message.to_string());
        }
        release_lock(job, JobStatus::Canceled, Utc::now());
        Ok(Some(job.status))
    }

    #[instrument(skip(self), err)]
    async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        Ok(match job.status {
            JobStatus::Queued => {
                job.status = JobStatus::Canceled;
                job.updated_at = Utc::now();
                CancelOutcome::Canceled
            }
            JobStatus::Running => {
                job.cancel_requested = true;
                job.updated_at = Utc::now();
                CancelOutcome::CancellationRequested
            }
            finished => CancelOutcome::AlreadyFinished(finished),
        })
    }

    #[instrument(skip(self), err)]
    async fn retry_now(&self, id: Uuid, reset_attempts: bool) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        match job.status {
            JobStatus::Queued => {}
            JobStatus::Failed if reset_attempts || job.attempts < job.max_attempts => {}
            JobStatus::Failed => {
                return Err(StoreError::AttemptsExhausted {
                    id,
                    attempts: job.attempts,
                    max_attempts: job.max_attempts,
                });
            }
            status => return Err(StoreError::InvalidState { id, status }),
        }

        let now = Utc::now();
        if reset_attempts {
            job.attempts = 0;
        }
        job.status = JobStatus::Queued;
        job.scheduled_at = now;
        job.updated_at = now;
        Ok(())
    }

    async fn cancel_requested(&self, id: Uuid) -> Result<bool, StoreError> {
        let jobs = self.jobs.lock().await;
        jobs.get(&id)
            .map(|job| job.cancel_requested)
            .ok_or(StoreError::NotFound(id))
    }

    async fn queued_count(&self) -> Result<i64, StoreError> {
        let jobs = self.jobs.lock().await;
        let count = jobs.values().filter(|job| job.status == JobStatus::Queued).count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, StoreError> {
        let now = Utc::now();
        let cutoff = before(now, older_than);
        let mut jobs = self.jobs.lock().await;

        let mut released = 0;
        for job in jobs.values_mut() {
            let Some(locked_at) = job.locked_at else {
                continue;
            };
            if job.status != JobStatus::Running || locked_at >= cutoff {
                continue;
            }

            let status = if job.cancel_requested {
                JobStatus::Canceled
            } else if job.attempts + 1 < job.max_attempts {
                JobStatus::Queued
            } else {
                JobStatus::Failed
            };
            job.attempts = (job.attempts + 1).min(job.max_attempts);
            job.scheduled_at = now;
            job.last_error = Some(format!(
                "lock held by {} expired",
                job.locked_by.as_deref().unwrap_or("unknown worker")
            ));
            release_lock(job, status, now);
            released += 1;
        }

        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EnqueueOptions;
    use claims::{assert_matches, assert_none, assert_ok, assert_some_eq};

    fn job(job_type: &str, options: EnqueueOptions) -> NewJob {
        NewJob::new(job_type, b"{}".to_vec(), options)
    }

    #[tokio::test]
    async fn claims_by_priority_then_schedule() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let earlier = Utc::now() - chrono::Duration::seconds(10);
        let low = store.enqueue(job("playbook", EnqueueOptions::default())).await?;
        let old_low = store
            .enqueue(job("playbook", EnqueueOptions::default().scheduled_at(earlier)))
            .await?;
        let high = store
            .enqueue(job("playbook", EnqueueOptions::default().priority(5)))
            .await?;

        let claimed: Vec<_> = store
            .claim_batch("w1", 10)
            .await?
            .into_iter()
            .map(|job| job.id)
            .collect();
        assert_eq!(claimed, [high, old_low, low]);
        Ok(())
    }

    #[tokio::test]
    async fn future_jobs_are_not_claimed() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let later = Utc::now() + chrono::Duration::hours(1);
        store
            .enqueue(job("playbook", EnqueueOptions::default().scheduled_at(later)))
            .await?;

        assert!(store.claim_batch("w1", 5).await?.is_empty());
        assert_eq!(store.queued_count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn claim_sets_lock_fields() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let id = store.enqueue(job("bootstrap", EnqueueOptions::default())).await?;

        let claimed = store.claim_batch("w1", 1).await?;
        assert_eq!(claimed.len(), 1);
        let job = &claimed[0];
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.locked_by.as_deref(), Some("w1"));
        assert!(job.locked_at.is_some());
        assert!(job.started_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn stale_finisher_is_ignored() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let id = store.enqueue(job("bootstrap", EnqueueOptions::default())).await?;
        store.claim_batch("w1", 1).await?;

        assert_none!(store.finish_success(id, "w2").await?);
        assert_none!(store.finish_failed(id, "w2", "boom").await?);
        assert_some_eq!(store.finish_success(id, "w1").await?, JobStatus::Success);
        assert_none!(store.finish_success(id, "w1").await?);
        Ok(())
    }

    #[tokio::test]
    async fn retry_requeues_with_backoff_then_fails() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(600));
        let id = store
            .enqueue(job("playbook", EnqueueOptions::default().max_attempts(2)))
            .await?;

        store.claim_batch("w1", 1).await?;
        let before = Utc::now();
        assert_some_eq!(store.finish_retry(id, "w1", "first", &backoff).await?, JobStatus::Queued);
        let job = assert_ok!(store.find(id).await).expect("job exists");
        assert_eq!(job.attempts, 1);
        assert!(job.scheduled_at >= before + chrono::Duration::seconds(30));
        assert_none!(job.locked_by);

        store.retry_now(id, false).await?;
        store.claim_batch("w1", 1).await?;
        assert_some_eq!(store.finish_retry(id, "w1", "second", &backoff).await?, JobStatus::Failed);
        let job = store.find(id).await?.expect("job exists");
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("second"));
        Ok(())
    }

    #[tokio::test]
    async fn cancel_and_retry_now_follow_the_state_machine() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let queued = store.enqueue(job("playbook", EnqueueOptions::default())).await?;
        let running = store.enqueue(job("playbook", EnqueueOptions::default())).await?;
        store.cancel(queued).await?;
        store.claim_batch("w1", 1).await?;

        assert_eq!(store.cancel(running).await?, CancelOutcome::CancellationRequested);
        assert!(store.cancel_requested(running).await?);
        assert_eq!(
            store.cancel(queued).await?,
            CancelOutcome::AlreadyFinished(JobStatus::Canceled)
        );
        assert_matches!(
            store.retry_now(running, false).await,
            Err(StoreError::InvalidState { status: JobStatus::Running, .. })
        );
        assert_matches!(store.cancel(Uuid::now_v7()).await, Err(StoreError::NotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn stale_locks_are_released() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let id = store.enqueue(job("playbook", EnqueueOptions::default())).await?;
        store.claim_batch("w1", 1).await?;

        assert_eq!(store.requeue_stale(Duration::from_secs(3600)).await?, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.requeue_stale(Duration::from_millis(1)).await?, 1);

        let job = store.find(id).await?.expect("job exists");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("lock held by w1 expired"));
        assert_none!(store.finish_success(id, "w1").await?);
        Ok(())
    }

    #[tokio::test]
    async fn failed_runs_of_cancel_requested_jobs_are_canceled() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let retried = store.enqueue(job("playbook", EnqueueOptions::default())).await?;
        let failed = store.enqueue(job("playbook", EnqueueOptions::default())).await?;
        store.claim_batch("w1", 2).await?;
        store.cancel(retried).await?;
        store.cancel(failed).await?;

        assert_some_eq!(
            store.finish_retry(retried, "w1", "interrupted", &Backoff::default()).await?,
            JobStatus::Canceled
        );
        assert_some_eq!(store.finish_failed(failed, "w1", "interrupted").await?, JobStatus::Canceled);

        for id in [retried, failed] {
            let job = store.find(id).await?.expect("job exists");
            assert_eq!(job.attempts, 0);
            assert_eq!(job.last_error.as_deref(), Some("interrupted"));
            assert_none!(job.locked_by);
        }
        Ok(())
    }
}
