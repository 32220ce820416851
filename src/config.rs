use crate::backoff::Backoff;
use std::time::Duration;
use uuid::Uuid;

pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_JITTER: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_CAPACITY: usize = 4;
/// Shortest accepted poll interval. Timers cannot tick with a zero period.
pub(crate) const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Settings of one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Identifier written to `locked_by` on every claimed job.
    ///
    /// Must be unique among the processes sharing a store.
    pub worker_id: String,
    /// Maximum number of jobs executing at once. Zero is treated as one.
    pub capacity: usize,
    /// Pause between two claim attempts. Values below one millisecond are
    /// raised to one millisecond when the runner starts.
    pub poll_interval: Duration,
    /// Upper bound of the random delay added to each poll interval.
    pub jitter: Duration,
    /// Delay applied to retried jobs.
    pub backoff: Backoff,
    /// Age after which a running job's lock is considered abandoned.
    /// `None` disables stale-lock recovery.
    pub stale_after: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            capacity: DEFAULT_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            backoff: Backoff::default(),
            stale_after: None,
        }
    }
}

/// `<hostname>-<pid>-<random>`, falling back to `worker` without a hostname.
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "worker".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}-{}-{}", std::process::id(), &suffix[..8])
}
