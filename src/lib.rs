#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod backoff;
mod config;
mod errors;
mod handler;
/// Handlers for the built-in job kinds.
pub mod handlers;
mod job_registry;
mod memory;
mod reaper;
mod recorder;
mod runner;
/// Job records and their lifecycle types.
pub mod schema;
mod storage;
mod store;
mod util;
mod worker;

/// Retry delay schedule.
pub use self::backoff::Backoff;
/// Worker settings.
pub use self::config::{WorkerConfig, default_worker_id};
/// Error types of store and enqueue operations.
pub use self::errors::{EnqueueError, StoreError};
/// The traits implemented by job payloads and their handlers.
pub use self::handler::{Handler, HandlerError, JobPayload};
/// Dispatch from job type to handler.
pub use self::job_registry::{JobError, JobRegistry};
/// In-process store for tests and local runs.
pub use self::memory::MemoryStore;
/// Writes job outcomes back to the store.
pub use self::recorder::{MAX_LAST_ERROR_LEN, OutcomeRecorder};
/// The main runner that orchestrates job processing.
pub use self::runner::{Configured, RunHandle, Runner, Unconfigured};
/// Postgres-backed store.
pub use self::storage::{PgStore, setup_database};
/// Storage seam shared by every store implementation.
pub use self::store::JobStore;
