//! Error types for the scheduler.

use armada_state::{CacheError, JobId, LedgerError, QueueError, StateError};
use thiserror::Error;

/// Scheduler errors.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Cache backend error.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Ledger backend error.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Queue backend error.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Backend construction error.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Heartbeat or deregistration before registration.
    #[error("worker is not registered")]
    NotRegistered,

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Job process could not be started.
    #[error("failed to spawn job {job_id}: {source}")]
    Spawn {
        job_id: JobId,
        #[source]
        source: std::io::Error,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
