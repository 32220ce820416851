use crate::handler::{Handler, HandlerError, JobPayload};
use crate::schema::{JobKind, UnknownJobKind};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a job did not complete.
#[derive(Debug, Error)]
pub enum JobError {
    /// The stored `job_type` names no known kind.
    #[error(transparent)]
    UnknownType(#[from] UnknownJobKind),

    /// This process has no handler for the kind.
    #[error("no handler registered for job type `{0}`")]
    NotRegistered(JobKind),

    /// The payload does not decode into the handler's payload type.
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        /// Kind the payload was decoded for
        kind: JobKind,
        /// Decoding error
        source: serde_json::Error,
    },

    /// The handler panicked.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The handler returned an error.
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl JobError {
    /// Whether the job may run again after this error.
    ///
    /// Dispatch errors can never succeed on retry and fail the job immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UnknownType(_) | Self::NotRegistered(_) | Self::InvalidPayload { .. } => false,
            Self::Panicked(_) => true,
            Self::Handler(error) => error.is_retryable(),
        }
    }
}

type RunHandlerFn =
    dyn Fn(Vec<u8>, CancellationToken) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync;

/// Maps each [`JobKind`] to the handler that runs it.
#[derive(Default, Clone)]
pub struct JobRegistry {
    handlers: HashMap<JobKind, Arc<RunHandlerFn>>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl JobRegistry {
    /// Register `handler` for its payload's kind, replacing any previous one.
    pub fn register<H: Handler>(&mut self, handler: H) {
        let handler = Arc::new(handler);
        let run: Arc<RunHandlerFn> = Arc::new(move |payload: Vec<u8>, cancel: CancellationToken| {
            let handler = Arc::clone(&handler);
            async move {
                let payload: H::Payload = serde_json::from_slice(&payload).map_err(|source| {
                    JobError::InvalidPayload {
                        kind: H::Payload::KIND,
                        source,
                    }
                })?;
                handler.run(payload, cancel).await?;
                Ok(())
            }
            .boxed()
        });
        self.handlers.insert(H::Payload::KIND, run);
    }

    /// Kinds with a registered handler, in declaration order.
    pub fn kinds(&self) -> Vec<JobKind> {
        JobKind::ALL
            .into_iter()
            .filter(|kind| self.handlers.contains_key(kind))
            .collect()
    }

    /// Decode `payload` and run the handler registered for `job_type`.
    ///
    /// Unknown and unregistered types are reported without running anything.
    pub async fn dispatch(
        &self,
        job_type: &str,
        payload: Vec<u8>,
        cancel: CancellationToken,
    ) -> Result<(), JobError> {
        let kind: JobKind = job_type.parse()?;
        let run = self.handlers.get(&kind).ok_or(JobError::NotRegistered(kind))?;
        run(payload, cancel).await
    }
}
