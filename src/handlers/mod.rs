//! Handlers for the built-in job kinds.

pub mod bootstrap;
pub mod playbook;

use crate::handler::HandlerError;
use anyhow::anyhow;
use std::future::Future;
use std::time::Duration;

/// Await `run`, failing with a retryable error once `limit` has elapsed.
async fn with_deadline<T>(
    limit: Option<Duration>,
    run: impl Future<Output = Result<T, HandlerError>>,
) -> Result<T, HandlerError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, run)
            .await
            .map_err(|_| anyhow!("timed out after {limit:?}"))?,
        None => run.await,
    }
}

/// Render captured output for an error message, keeping the tail.
fn output_excerpt(output: &[u8]) -> String {
    const MAX_EXCERPT: usize = 2048;

    let output = String::from_utf8_lossy(output);
    let output = output.trim();
    if output.len() <= MAX_EXCERPT {
        return output.to_string();
    }
    let mut start = output.len() - MAX_EXCERPT;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!("…{}", &output[start..])
}
