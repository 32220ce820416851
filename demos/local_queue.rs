//! Runs the worker pool against the in-memory store.
//!
//! No database or container runtime is needed: playbook jobs are handed to
//! `echo` instead of `docker`, so each run just prints its command line.
//!
//! ```bash
//! cargo run --example local_queue
//! ```

use anyhow::Result;
use fleet_jobs::handlers::playbook::{ContainerRuntime, PlaybookHandler, PlaybookJob};
use fleet_jobs::schema::{EnqueueOptions, NewJob};
use fleet_jobs::{JobPayload, JobStore, MemoryStore, Runner};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store = MemoryStore::new();

    for (priority, playbook) in [(0, "site.yml"), (10, "hotfix.yml"), (-5, "cleanup.yml")] {
        let job = PlaybookJob {
            image: "cytopia/ansible:latest".into(),
            playbook: playbook.into(),
            inventory: "hosts.ini".into(),
            key_file: "/tmp/id_ed25519".into(),
            workspace: "/tmp/checkout".into(),
            extra_vars: vec![format!("run={playbook}")],
            ssh_args: vec!["-o".into(), "StrictHostKeyChecking=no".into()],
        };
        job.enqueue(&store, EnqueueOptions::default().priority(priority))
            .await?;
    }

    // Nothing handles this type, so it fails on its first claim.
    store
        .enqueue(NewJob::new("reboot", b"{}".to_vec(), EnqueueOptions::default()))
        .await?;

    let runner = Runner::new(Arc::new(store.clone()))
        .capacity(2)
        .poll_interval(Duration::from_millis(100))
        .register(PlaybookHandler::new(ContainerRuntime::new("echo")))
        .shutdown_when_queue_empty();

    runner.start().wait_for_shutdown().await;

    println!("\nFinal job states:");
    for job in store.jobs().await {
        println!(
            "  {} {:<8} {:<8} attempts={} error={}",
            job.id,
            job.job_type,
            job.status,
            job.attempts,
            job.last_error.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}
