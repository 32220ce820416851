#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use claims::{assert_err, assert_matches, assert_none, assert_some, assert_some_eq};
use fleet_jobs::handlers::playbook::PlaybookJob;
use fleet_jobs::schema::{CancelOutcome, EnqueueOptions, JobStatus, NewJob};
use fleet_jobs::{Backoff, JobPayload, JobStore, PgStore, StoreError, setup_database};
use insta::assert_json_snapshot;
use sqlx::PgPool;
use std::collections::HashSet;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

/// Start Postgres in a container and run the migrations.
///
/// The container is removed when the returned handle is dropped.
async fn start_store() -> anyhow::Result<(PgStore, ContainerAsync<Postgres>)> {
    let container = Postgres::default().start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;

    let pool = PgPool::connect(&format!("postgresql://postgres:postgres@{host}:{port}/postgres")).await?;
    setup_database(&pool).await?;
    Ok((PgStore::new(pool), container))
}

async fn enqueue(store: &PgStore, max_attempts: i32) -> anyhow::Result<Uuid> {
    let options = EnqueueOptions::default().max_attempts(max_attempts);
    Ok(store
        .enqueue(NewJob::new("playbook", b"{}".to_vec(), options))
        .await?)
}

#[tokio::test]
#[ignore = "needs a Docker daemon"]
async fn claims_lock_jobs_in_priority_order() -> anyhow::Result<()> {
    let (store, _container) = start_store().await?;

    let low = store
        .enqueue(NewJob::new("playbook", b"{}".to_vec(), EnqueueOptions::default().priority(-1)))
        .await?;
    let high = store
        .enqueue(NewJob::new("playbook", b"{}".to_vec(), EnqueueOptions::default().priority(5)))
        .await?;
    let later = store
        .enqueue(NewJob::new(
            "playbook",
            b"{}".to_vec(),
            EnqueueOptions::default()
                .priority(100)
                .scheduled_at(chrono::Utc::now() + chrono::Duration::hours(1)),
        ))
        .await?;

    let jobs = store.claim_batch("w1", 10).await?;
    let ids: Vec<_> = jobs.iter().map(|job| job.id).collect();
    assert_eq!(ids, [high, low]);
    for job in &jobs {
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.locked_by.as_deref(), Some("w1"));
        assert_some!(job.locked_at);
        assert_some!(job.started_at);
    }

    assert_eq!(assert_some!(store.find(later).await?).status, JobStatus::Queued);
    assert!(store.claim_batch("w1", 0).await?.is_empty());
    Ok(())
}

#[tokio::test]
#[ignore = "needs a Docker daemon"]
async fn concurrent_claims_never_overlap() -> anyhow::Result<()> {
    let (store, _container) = start_store().await?;
    for _ in 0..40 {
        enqueue(&store, 3).await?;
    }

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let store = store.clone();
            tokio::spawn(async move { store.claim_batch(&format!("w{worker}"), 15).await })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for job in handle.await?? {
            assert!(seen.insert(job.id), "job {} was claimed twice", job.id);
        }
    }

    // Skipped rows can leave a few jobs behind; a later claim picks them up.
    for job in store.claim_batch("sweeper", 40).await? {
        assert!(seen.insert(job.id), "job {} was claimed twice", job.id);
    }
    assert_eq!(seen.len(), 40);
    Ok(())
}

#[tokio::test]
#[ignore = "needs a Docker daemon"]
async fn running_rows_must_be_locked() -> anyhow::Result<()> {
    let (store, _container) = start_store().await?;
    let id = enqueue(&store, 3).await?;

    let result = sqlx::query("UPDATE jobs SET status = 'running' WHERE id = $1")
        .bind(id)
        .execute(store.pool())
        .await;
    assert_err!(result);
    Ok(())
}

#[tokio::test]
#[ignore = "needs a Docker daemon"]
async fn retries_back_off_then_fail() -> anyhow::Result<()> {
    let (store, _container) = start_store().await?;
    let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(3600));
    let id = enqueue(&store, 3).await?;

    let mut gaps = Vec::new();
    for _ in 0..2 {
        store.claim_batch("w1", 1).await?;
        assert_some_eq!(
            store.finish_retry(id, "w1", "boom", &backoff).await?,
            JobStatus::Queued
        );
        let job = assert_some!(store.find(id).await?);
        assert_none!(job.locked_by);
        gaps.push((job.scheduled_at - job.updated_at).num_seconds());
        store.retry_now(id, false).await?;
    }
    assert_eq!(gaps, [10, 20]);

    store.claim_batch("w1", 1).await?;
    assert_some_eq!(
        store.finish_retry(id, "w1", "still boom", &backoff).await?,
        JobStatus::Failed
    );
    let job = assert_some!(store.find(id).await?);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("still boom"));

    let err = store.retry_now(id, false).await.unwrap_err();
    assert_matches!(err, StoreError::AttemptsExhausted { .. });
    store.retry_now(id, true).await?;
    assert_eq!(assert_some!(store.find(id).await?).attempts, 0);
    Ok(())
}

#[tokio::test]
#[ignore = "needs a Docker daemon"]
async fn finishers_without_the_lock_change_nothing() -> anyhow::Result<()> {
    let (store, _container) = start_store().await?;
    let id = enqueue(&store, 3).await?;
    store.claim_batch("w1", 1).await?;

    assert_none!(store.finish_success(id, "w2").await?);
    assert_none!(store.finish_failed(id, "w2", "nope").await?);
    assert_none!(store.finish_retry(id, "w2", "nope", &Backoff::default()).await?);
    assert_eq!(assert_some!(store.find(id).await?).status, JobStatus::Running);

    assert_some_eq!(store.finish_success(id, "w1").await?, JobStatus::Success);
    assert_none!(store.finish_success(id, "w1").await?);
    Ok(())
}

#[tokio::test]
#[ignore = "needs a Docker daemon"]
async fn cancel_depends_on_the_current_status() -> anyhow::Result<()> {
    let (store, _container) = start_store().await?;
    let queued = enqueue(&store, 3).await?;
    assert_eq!(store.cancel(queued).await?, CancelOutcome::Canceled);
    assert!(store.claim_batch("w1", 10).await?.is_empty());

    let running = enqueue(&store, 3).await?;
    store.claim_batch("w1", 1).await?;
    assert_eq!(store.cancel(running).await?, CancelOutcome::CancellationRequested);
    assert!(store.cancel_requested(running).await?);
    assert_some_eq!(
        store.finish_canceled(running, "w1", Some("canceled before completion")).await?,
        JobStatus::Canceled
    );
    assert_eq!(
        store.cancel(running).await?,
        CancelOutcome::AlreadyFinished(JobStatus::Canceled)
    );

    let flagged = enqueue(&store, 3).await?;
    store.claim_batch("w1", 1).await?;
    store.cancel(flagged).await?;
    assert_some_eq!(
        store.finish_retry(flagged, "w1", "interrupted", &Backoff::default()).await?,
        JobStatus::Canceled
    );
    assert_eq!(assert_some!(store.find(flagged).await?).attempts, 0);

    let err = store.cancel(Uuid::now_v7()).await.unwrap_err();
    assert_matches!(err, StoreError::NotFound(_));
    let err = store.retry_now(running, false).await.unwrap_err();
    assert_matches!(err, StoreError::InvalidState { status: JobStatus::Canceled, .. });
    Ok(())
}

#[tokio::test]
#[ignore = "needs a Docker daemon"]
async fn stale_locks_are_released() -> anyhow::Result<()> {
    let (store, _container) = start_store().await?;
    let id = enqueue(&store, 3).await?;
    store.claim_batch("w1", 1).await?;

    assert_eq!(store.requeue_stale(Duration::from_secs(3600)).await?, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.requeue_stale(Duration::from_millis(1)).await?, 1);

    let job = assert_some!(store.find(id).await?);
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("lock held by w1 expired"));
    assert_none!(store.finish_success(id, "w1").await?);
    Ok(())
}

#[tokio::test]
#[ignore = "needs a Docker daemon"]
async fn typed_payloads_are_stored_as_json() -> anyhow::Result<()> {
    let (store, _container) = start_store().await?;
    let job = PlaybookJob {
        image: "cytopia/ansible:latest".into(),
        playbook: "site.yml".into(),
        inventory: "hosts.ini".into(),
        key_file: "/keys/id".into(),
        workspace: "/srv".into(),
        extra_vars: vec!["env=prod".into()],
        ssh_args: vec![],
    };

    let id = job.enqueue(&store, EnqueueOptions::default()).await?;
    let stored = assert_some!(store.find(id).await?);
    assert_eq!(stored.job_type, "playbook");
    assert_eq!(stored.max_attempts, 3);
    assert_eq!(store.queued_count().await?, 1);
    assert_json_snapshot!(serde_json::from_slice::<serde_json::Value>(&stored.payload)?, @r#"
    {
      "extra_vars": [
        "env=prod"
      ],
      "image": "cytopia/ansible:latest",
      "inventory": "hosts.ini",
      "key_file": "/keys/id",
      "playbook": "site.yml",
      "ssh_args": [],
      "workspace": "/srv"
    }
    "#);
    Ok(())
}
