use crate::backoff::Backoff;
use crate::errors::StoreError;
use crate::schema::{CancelOutcome, Job, JobStatus, NewJob};
use crate::store::JobStore;
use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

macro_rules! job_columns {
    () => {
        "id, job_type, payload, status, priority, attempts, max_attempts, scheduled_at, \
         started_at, locked_by, locked_at, last_error, cancel_requested, created_at, updated_at"
    };
}

/// Create the `jobs` table and its indexes if they do not exist yet.
pub async fn setup_database(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// [`JobStore`] backed by PostgreSQL.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so any number of processes can poll the
/// same table without coordinating otherwise.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap a connection pool. Call [`setup_database`] once beforehand.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgStore {
    #[instrument(skip_all, err, fields(job.type = %job.job_type))]
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, StoreError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r"
            INSERT INTO jobs (id, job_type, payload, priority, max_attempts, scheduled_at)
            VALUES ($1, $2, $3, $4, $5, COALESCE($6, NOW()))
            RETURNING id
            ",
        )
        .bind(job.id)
        .bind(job.job_type)
        .bind(job.payload)
        .bind(job.priority)
        .bind(job.max_attempts)
        .bind(job.scheduled_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let job = sqlx::query_as::<_, Job>(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn claim_batch(&self, worker_id: &str, limit: usize) -> Result<Vec<Job>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        // Selection and update happen in one statement; rows another claimant
        // has locked are skipped rather than waited on.
        let mut jobs = sqlx::query_as::<_, Job>(concat!(
            r"
            WITH next_jobs AS (
                SELECT id
                FROM jobs
                WHERE status = 'queued' AND scheduled_at <= NOW()
                ORDER BY priority DESC, scheduled_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                locked_by = $1,
                locked_at = NOW(),
                started_at = NOW(),
                cancel_requested = FALSE,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING ",
            job_columns!()
        ))
        .bind(worker_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_at.cmp(&b.scheduled_at))
        });
        Ok(jobs)
    }

    async fn finish_success(&self, id: Uuid, worker_id: &str) -> Result<Option<JobStatus>, StoreError> {
        let status = sqlx::query_scalar::<_, JobStatus>(
            r"
            UPDATE jobs
            SET status = 'success',
                locked_by = NULL,
                locked_at = NULL,
                cancel_requested = FALSE,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND locked_by = $2
            RETURNING status
            ",
        )
        .bind(id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(status)
    }

    async fn finish_retry(
        &self,
        id: Uuid,
        worker_id: &str,
        last_error: &str,
        backoff: &Backoff,
    ) -> Result<Option<JobStatus>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, (i32, i32, bool)>(
            r"
            SELECT attempts, max_attempts, cancel_requested
            FROM jobs
            WHERE id = $1 AND status = 'running' AND locked_by = $2
            FOR UPDATE
            ",
        )
        .bind(id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((attempts, max_attempts, cancel_requested)) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let attempts = attempts + 1;
        let status = if cancel_requested {
            sqlx::query_scalar::<_, JobStatus>(
                r"
                UPDATE jobs
                SET status = 'canceled',
                    last_error = $2,
                    locked_by = NULL,
                    locked_at = NULL,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING status
                ",
            )
            .bind(id)
            .bind(last_error)
            .fetch_one(&mut *tx)
            .await?
        } else if attempts < max_attempts {
            let delay = backoff.delay_for(attempts);
            sqlx::query_scalar::<_, JobStatus>(
                r"
                UPDATE jobs
                SET status = 'queued',
                    attempts = $2,
                    scheduled_at = NOW() + make_interval(secs => $3),
                    last_error = $4,
                    locked_by = NULL,
                    locked_at = NULL,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING status
                ",
            )
            .bind(id)
            .bind(attempts)
            .bind(delay.as_secs_f64())
            .bind(last_error)
            .fetch_one(&mut *tx)
            .await?
        } else {
            sqlx::query_scalar::<_, JobStatus>(
                r"
                UPDATE jobs
                SET status = 'failed',
                    attempts = $2,
                    last_error = $3,
                    locked_by = NULL,
                    locked_at = NULL,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING status
                ",
            )
            .bind(id)
            .bind(max_attempts)
            .bind(last_error)
            .fetch_one(&mut *tx)
            .await?
        };

        tx.commit().await?;
        Ok(Some(status))
    }

    async fn finish_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        last_error: &str,
    ) -> Result<Option<JobStatus>, StoreError> {
        let status = sqlx::query_scalar::<_, JobStatus>(
            r"
            UPDATE jobs
            SET status = CASE WHEN cancel_requested THEN 'canceled'::job_status ELSE 'failed'::job_status END,
                attempts = CASE WHEN cancel_requested THEN attempts ELSE LEAST(attempts + 1, max_attempts) END,
                last_error = $3,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND locked_by = $2
            RETURNING status
            ",
        )
        .bind(id)
        .bind(worker_id)
        .bind(last_error)
        .fetch_optional(&self.pool)
        .await?;

        Ok(status)
    }

    async fn finish_canceled(
        &self,
        id: Uuid,
        worker_id: &str,
        last_error: Option<&str>,
    ) -> Result<Option<JobStatus>, StoreError> {
        let status = sqlx::query_scalar::<_, JobStatus>(
            r"
            UPDATE jobs
            SET status = 'canceled',
                last_error = COALESCE($3, last_error),
                locked_by = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND locked_by = $2
            RETURNING status
            ",
        )
        .bind(id)
        .bind(worker_id)
        .bind(last_error)
        .fetch_optional(&self.pool)
        .await?;

        Ok(status)
    }

    #[instrument(skip(self), err)]
    async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let status = sqlx::query_scalar::<_, JobStatus>("SELECT status FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        let outcome = match status {
            JobStatus::Queued => {
                sqlx::query("UPDATE jobs SET status = 'canceled', updated_at = NOW() WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                CancelOutcome::Canceled
            }
            JobStatus::Running => {
                sqlx::query("UPDATE jobs SET cancel_requested = TRUE, updated_at = NOW() WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                CancelOutcome::CancellationRequested
            }
            finished => CancelOutcome::AlreadyFinished(finished),
        };

        tx.commit().await?;
        Ok(outcome)
    }

    #[instrument(skip(self), err)]
    async fn retry_now(&self, id: Uuid, reset_attempts: bool) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let (status, attempts, max_attempts) = sqlx::query_as::<_, (JobStatus, i32, i32)>(
            "SELECT status, attempts, max_attempts FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        match status {
            JobStatus::Queued => {}
            JobStatus::Failed if reset_attempts || attempts < max_attempts => {}
            JobStatus::Failed => {
                return Err(StoreError::AttemptsExhausted {
                    id,
                    attempts,
                    max_attempts,
                });
            }
            status => return Err(StoreError::InvalidState { id, status }),
        }

        sqlx::query(
            r"
            UPDATE jobs
            SET status = 'queued',
                scheduled_at = NOW(),
                attempts = CASE WHEN $2 THEN 0 ELSE attempts END,
                updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(reset_attempts)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn cancel_requested(&self, id: Uuid) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>("SELECT cancel_requested FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    async fn queued_count(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE status = 'queued'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET status = CASE
                    WHEN cancel_requested THEN 'canceled'::job_status
                    WHEN attempts + 1 < max_attempts THEN 'queued'::job_status
                    ELSE 'failed'::job_status
                END,
                attempts = LEAST(attempts + 1, max_attempts),
                scheduled_at = NOW(),
                last_error = 'lock held by ' || locked_by || ' expired',
                locked_by = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE status = 'running' AND locked_at < NOW() - make_interval(secs => $1)
            ",
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
