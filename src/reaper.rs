use crate::store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub(crate) const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Releases the locks of jobs whose worker stopped reporting back.
pub(crate) struct Reaper {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) stale_after: Duration,
    pub(crate) every: Duration,
}

impl Reaper {
    /// Release stale locks once, returning how many jobs were touched.
    pub(crate) async fn reap(&self) -> u64 {
        match self.store.requeue_stale(self.stale_after).await {
            Ok(0) => {
                debug!("No stale jobs found");
                0
            }
            Ok(released) => {
                info!(released, "Released jobs with expired locks");
                released
            }
            Err(error) => {
                error!("Failed to release stale jobs: {error}");
                0
            }
        }
    }

    pub(crate) async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.reap().await;
                }
            }
        }
    }
}
