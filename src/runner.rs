use crate::backoff::Backoff;
use crate::config::{MIN_POLL_INTERVAL, WorkerConfig};
use crate::handler::Handler;
use crate::job_registry::JobRegistry;
use crate::reaper::{DEFAULT_REAP_INTERVAL, Reaper};
use crate::recorder::OutcomeRecorder;
use crate::store::JobStore;
use crate::worker::WorkerPool;
use futures_util::future::join_all;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

/// Marker type for a configured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// Claims jobs from a [`JobStore`] and runs them with the registered handlers.
///
/// A runner can only be started once at least one handler is registered.
pub struct Runner<State = Unconfigured> {
    store: Arc<dyn JobStore>,
    job_registry: JobRegistry,
    config: WorkerConfig,
    shutdown_when_queue_empty: bool,
    _state: PhantomData<State>,
}

impl<State: std::fmt::Debug> std::fmt::Debug for Runner<State> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("job_registry", &self.job_registry)
            .field("config", &self.config)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl Runner {
    /// Create a new runner with default settings.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            job_registry: JobRegistry::default(),
            config: WorkerConfig::default(),
            shutdown_when_queue_empty: false,
            _state: PhantomData,
        }
    }
}

impl<State> Runner<State> {
    /// Run jobs of `H::Payload::KIND` with `handler`.
    pub fn register<H: Handler>(mut self, handler: H) -> Runner<Configured> {
        self.job_registry.register(handler);

        Runner {
            store: self.store,
            job_registry: self.job_registry,
            config: self.config,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            _state: PhantomData,
        }
    }

    /// Replace all settings at once.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the identifier written to `locked_by`.
    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.config.worker_id = worker_id.into();
        self
    }

    /// Set how many jobs may run at the same time. Values below 1 are raised to 1.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity.max(1);
        self
    }

    /// Set how often the store is polled for new jobs. Values below one
    /// millisecond are raised to one millisecond.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter keeps workers started together from polling in lockstep. The
    /// actual jitter is a random value between 0 and `jitter`.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Set the delay schedule of retried jobs.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Release locks held longer than `stale_after`.
    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.config.stale_after = Some(stale_after);
        self
    }

    /// Set the runner to shut down when the job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// The current settings.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }
}

impl Runner<Configured> {
    /// Start the worker pool, and the stale-lock reaper if enabled.
    ///
    /// This returns a [`RunHandle`] which can be used to stop the runner and
    /// to wait for it to finish.
    pub fn start(&self) -> RunHandle {
        let shutdown = CancellationToken::new();
        let worker_id: Arc<str> = self.config.worker_id.as_str().into();
        info!(
            worker.id = %worker_id,
            capacity = self.config.capacity,
            kinds = ?self.job_registry.kinds(),
            "Starting worker pool…"
        );

        let pool = Arc::new(WorkerPool {
            store: Arc::clone(&self.store),
            job_registry: Arc::new(self.job_registry.clone()),
            recorder: OutcomeRecorder::new(Arc::clone(&self.store), Arc::clone(&worker_id), self.config.backoff),
            worker_id: Arc::clone(&worker_id),
            capacity: self.config.capacity.max(1),
            poll_interval: self.config.poll_interval.max(MIN_POLL_INTERVAL),
            jitter: self.config.jitter,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
        });

        let span = info_span!("worker", worker.id = %worker_id);
        let pool_shutdown = shutdown.clone();
        let mut handles = vec![tokio::spawn(
            async move {
                pool.run(pool_shutdown.clone()).await;
                // A drained pool stops the reaper too.
                pool_shutdown.cancel();
            }
            .instrument(span.clone()),
        )];

        if let Some(stale_after) = self.config.stale_after {
            let reaper = Reaper {
                store: Arc::clone(&self.store),
                stale_after,
                every: DEFAULT_REAP_INTERVAL,
            };
            handles.push(tokio::spawn(reaper.run(shutdown.clone()).instrument(span)));
        }

        RunHandle { shutdown, handles }
    }
}

/// Handle to a running worker pool
#[derive(Debug)]
pub struct RunHandle {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Stop claiming jobs and signal running jobs to cancel.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// The token that stops the runner when canceled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait for the pool and the reaper to shut down.
    ///
    /// Running jobs are awaited, so this returns once every outcome is recorded.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });
    }
}
