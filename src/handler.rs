use crate::errors::EnqueueError;
use crate::schema::{EnqueueOptions, JobKind, NewJob};
use crate::store::JobStore;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

/// Error returned by a [`Handler`].
///
/// Anything converted from [`anyhow::Error`] is retryable. A handler that knows
/// retrying cannot help returns [`HandlerError::Permanent`].
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Transient failure; the job is retried while attempts remain.
    #[error(transparent)]
    Retryable(#[from] anyhow::Error),

    /// Failure no retry can fix; the job fails immediately.
    #[error(transparent)]
    Permanent(anyhow::Error),

    /// The handler observed cancellation and stopped early.
    #[error("canceled before completion")]
    Canceled,
}

impl HandlerError {
    /// Wrap an error that retrying will not fix.
    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(error.into())
    }

    /// Whether the job may run again after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

/// Typed payload of a job kind.
///
/// Payloads are stored as JSON; the kind decides which handler decodes them.
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The job kind this payload belongs to.
    const KIND: JobKind;

    /// Default priority of the job.
    ///
    /// [`EnqueueOptions::priority`] overrides this value.
    const PRIORITY: i32 = 0;

    /// Enqueue this payload for background execution.
    #[instrument(name = "jobs.enqueue", skip_all, fields(job.type = %Self::KIND))]
    fn enqueue<'a>(
        &'a self,
        store: &'a dyn JobStore,
        options: EnqueueOptions,
    ) -> BoxFuture<'a, Result<Uuid, EnqueueError>> {
        let payload = match serde_json::to_vec(self) {
            Ok(payload) => payload,
            Err(err) => return async move { Err(EnqueueError::SerializationError(err)) }.boxed(),
        };

        let mut options = options;
        options.priority.get_or_insert(Self::PRIORITY);

        let job = NewJob::new(Self::KIND.as_str(), payload, options);
        async move { Ok(store.enqueue(job).await?) }.boxed()
    }
}

/// Execution logic for one [`JobKind`].
///
/// A handler performs one side effect and reports a single, unambiguous
/// outcome. It must watch `cancel` and stop promptly once it fires.
pub trait Handler: Send + Sync + 'static {
    /// The payload this handler consumes.
    type Payload: JobPayload;

    /// Execute the job.
    fn run(
        &self,
        payload: Self::Payload,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;
}
