use anyhow::{Context, bail};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use fleet_jobs::handlers::bootstrap::{BootstrapHandler, BootstrapJob, SshShell};
use fleet_jobs::handlers::playbook::{ContainerRuntime, PlaybookHandler, PlaybookJob};
use fleet_jobs::schema::{CancelOutcome, EnqueueOptions, Job};
use fleet_jobs::{Backoff, JobPayload, JobStore, PgStore, Runner, WorkerConfig, default_worker_id, setup_database};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "fleet-jobs")]
#[command(version)]
#[command(about = "Durable job queue for host bootstrap and playbook runs")]
#[command(propagate_version = true)]
struct Args {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Claim and run jobs until interrupted
    Worker(WorkerArgs),

    /// Add a job to the queue
    Enqueue(EnqueueArgs),

    /// Show a job record
    Status {
        /// The job ID
        id: Uuid,
    },

    /// Cancel a queued job, or ask a running one to stop
    Cancel {
        /// The job ID
        id: Uuid,
    },

    /// Make a queued or failed job claimable now
    Retry {
        /// The job ID
        id: Uuid,

        /// Start counting attempts from zero again
        #[arg(long)]
        reset_attempts: bool,
    },
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Identifier written to `locked_by` (default: <hostname>-<pid>-<random>)
    #[arg(long, env = "FLEET_JOBS_WORKER_ID")]
    worker_id: Option<String>,

    /// Maximum number of jobs running at once
    #[arg(long, env = "FLEET_JOBS_CAPACITY", default_value = "4")]
    capacity: usize,

    /// Milliseconds between polls
    #[arg(long, default_value = "1000", value_parser = clap::value_parser!(u64).range(1..))]
    poll_interval_ms: u64,

    /// Upper bound of the random delay added to each poll, in milliseconds
    #[arg(long, default_value = "100")]
    jitter_ms: u64,

    /// Delay before the first retry, in seconds
    #[arg(long, default_value = "60")]
    backoff_base_secs: u64,

    /// Longest retry delay, in seconds
    #[arg(long, default_value = "21600")]
    backoff_max_secs: u64,

    /// Release locks older than this many seconds (disabled when absent)
    #[arg(long)]
    stale_after_secs: Option<u64>,

    /// Exit once no job is queued or running
    #[arg(long)]
    drain: bool,

    /// Program used to start playbook containers
    #[arg(long, env = "FLEET_JOBS_CONTAINER_RUNTIME", default_value = "docker")]
    container_runtime: String,

    /// Hard limit for one playbook run, in seconds
    #[arg(long)]
    playbook_timeout_secs: Option<u64>,

    /// Hard limit for one bootstrap session, in seconds
    #[arg(long)]
    bootstrap_timeout_secs: Option<u64>,
}

impl WorkerArgs {
    fn config(&self) -> WorkerConfig {
        WorkerConfig {
            worker_id: self.worker_id.clone().unwrap_or_else(default_worker_id),
            capacity: self.capacity.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            jitter: Duration::from_millis(self.jitter_ms),
            backoff: Backoff::new(
                Duration::from_secs(self.backoff_base_secs),
                Duration::from_secs(self.backoff_max_secs),
            ),
            stale_after: self.stale_after_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Bootstrap,
    Playbook,
}

#[derive(Parser, Debug)]
struct EnqueueArgs {
    /// Job type
    kind: Kind,

    /// File holding the JSON payload (`-` reads stdin)
    payload: PathBuf,

    /// Higher runs first (default: the job type's priority)
    #[arg(long, allow_negative_numbers = true)]
    priority: Option<i32>,

    /// Maximum number of attempts
    #[arg(long, default_value = "3")]
    max_attempts: i32,

    /// Seconds to wait before the job becomes claimable
    #[arg(long)]
    delay_secs: Option<i64>,
}

impl EnqueueArgs {
    fn options(&self) -> anyhow::Result<EnqueueOptions> {
        let mut options = EnqueueOptions::default().max_attempts(self.max_attempts);
        if let Some(priority) = self.priority {
            options = options.priority(priority);
        }
        if let Some(delay) = self.delay_secs {
            let at = chrono::Duration::try_seconds(delay)
                .and_then(|delay| Utc::now().checked_add_signed(delay))
                .with_context(|| format!("delay of {delay}s is out of range"))?;
            options = options.scheduled_at(at);
        }
        Ok(options)
    }

    async fn read_payload(&self) -> anyhow::Result<Vec<u8>> {
        if self.payload.as_os_str() == "-" {
            use tokio::io::AsyncReadExt;
            let mut payload = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut payload)
                .await
                .context("failed to read the payload from stdin")?;
            return Ok(payload);
        }
        tokio::fs::read(&self.payload)
            .await
            .with_context(|| format!("failed to read {}", self.payload.display()))
    }
}

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
fn install_shutdown_handler() -> anyhow::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        }
        trigger.cancel();
    });

    Ok(token)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_worker(store: Arc<dyn JobStore>, args: WorkerArgs) -> anyhow::Result<()> {
    let mut bootstrap = BootstrapHandler::new(SshShell::default());
    if let Some(secs) = args.bootstrap_timeout_secs {
        bootstrap = bootstrap.with_timeout(Duration::from_secs(secs));
    }
    let mut playbook = PlaybookHandler::new(ContainerRuntime::new(&args.container_runtime));
    if let Some(secs) = args.playbook_timeout_secs {
        playbook = playbook.with_timeout(Duration::from_secs(secs));
    }

    let mut runner = Runner::new(store)
        .with_config(args.config())
        .register(bootstrap)
        .register(playbook);
    if args.drain {
        runner = runner.shutdown_when_queue_empty();
    }

    let signals = install_shutdown_handler()?;
    let handle = runner.start();
    let stop = handle.shutdown_token();
    tokio::spawn(async move {
        signals.cancelled().await;
        stop.cancel();
    });

    handle.wait_for_shutdown().await;
    info!("Worker stopped");
    Ok(())
}

async fn enqueue(store: &dyn JobStore, args: EnqueueArgs) -> anyhow::Result<Uuid> {
    let payload = args.read_payload().await?;
    let options = args.options()?;

    let id = match args.kind {
        Kind::Bootstrap => {
            let job: BootstrapJob = serde_json::from_slice(&payload).context("invalid bootstrap payload")?;
            job.enqueue(store, options).await?
        }
        Kind::Playbook => {
            let job: PlaybookJob = serde_json::from_slice(&payload).context("invalid playbook payload")?;
            job.enqueue(store, options).await?
        }
    };
    Ok(id)
}

fn describe(job: &Job) -> serde_json::Value {
    json!({
        "id": job.id,
        "type": job.job_type,
        "status": job.status.as_str(),
        "priority": job.priority,
        "attempts": job.attempts,
        "max_attempts": job.max_attempts,
        "scheduled_at": job.scheduled_at,
        "started_at": job.started_at,
        "locked_by": job.locked_by,
        "last_error": job.last_error,
        "cancel_requested": job.cancel_requested,
        "created_at": job.created_at,
        "updated_at": job.updated_at,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    let Some(database_url) = args.database_url else {
        bail!("no database configured; pass --database-url or set DATABASE_URL");
    };
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("failed to connect to the database")?;
    setup_database(&pool).await?;
    let store: Arc<dyn JobStore> = Arc::new(PgStore::new(pool));

    match args.command {
        Commands::Worker(worker_args) => run_worker(store, worker_args).await?,
        Commands::Enqueue(enqueue_args) => {
            let id = enqueue(store.as_ref(), enqueue_args).await?;
            println!("{id}");
        }
        Commands::Status { id } => {
            let job = store.find(id).await?.with_context(|| format!("job {id} not found"))?;
            println!("{:#}", describe(&job));
        }
        Commands::Cancel { id } => match store.cancel(id).await? {
            CancelOutcome::Canceled => println!("canceled"),
            CancelOutcome::CancellationRequested => println!("cancellation requested"),
            CancelOutcome::AlreadyFinished(status) => println!("already {status}"),
        },
        Commands::Retry { id, reset_attempts } => {
            store.retry_now(id, reset_attempts).await?;
            println!("queued");
        }
    }

    Ok(())
}
