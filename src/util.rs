use crate::job_registry::JobError;
use sentry_core::protocol::SpanStatus;
use sentry_core::{Hub, SentryFutureExt, TransactionContext};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;

/// Run `callback` inside a Sentry transaction named after the job type.
///
/// The transaction is bound to a fresh hub so concurrent jobs do not share
/// scope state.
pub(crate) async fn with_sentry_transaction<F, Fut, R, E>(transaction_name: &str, callback: F) -> Result<R, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let hub = Arc::new(Hub::new_from_top(Hub::current()));
    let ctx = TransactionContext::new(transaction_name, "fleet_jobs.perform");
    let transaction = hub.start_transaction(ctx);
    hub.configure_scope(|scope| scope.set_span(Some(transaction.clone().into())));

    let result = callback().bind_hub(hub).await;

    transaction.set_status(match result {
        Ok(_) => SpanStatus::Ok,
        Err(_) => SpanStatus::UnknownError,
    });
    transaction.finish();

    result
}

/// Turn the payload of a caught panic into a job error.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> JobError {
    if let Some(message) = info.downcast_ref::<&str>() {
        JobError::Panicked((*message).to_string())
    } else if let Some(message) = info.downcast_ref::<String>() {
        JobError::Panicked(message.clone())
    } else {
        JobError::Panicked("unknown panic payload".to_string())
    }
}
