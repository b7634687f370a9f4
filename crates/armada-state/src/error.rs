use thiserror::Error;

use crate::types::{AllocationStatus, JobId, JobState};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Value at {key} is not an integer")]
    NotAnInteger { key: String },

    #[error("Serialisation error: {0}")]
    Serialisation(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job {job_id} is {state}, expected pending")]
    JobNotPending { job_id: JobId, state: JobState },

    /// A second live allocation was attempted for the same job.
    #[error("Job {0} already holds a live allocation")]
    AllocationConflict(JobId),

    #[error("Job {job_id} has no reserved allocation (found {found:?})")]
    NotReserved {
        job_id: JobId,
        found: Option<AllocationStatus>,
    },

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Serialisation error: {0}")]
    Serialisation(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Serialisation error: {0}")]
    Serialisation(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Backend not configured: {0}")]
    NotConfigured(String),

    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),
}
