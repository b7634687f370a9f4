use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{CacheError, LedgerError, QueueError};
use crate::types::{Allocation, JobId, JobRecord, JobSpec, JobState, Message, MessageId};

/// Low-latency expiring key-value store.
///
/// Nothing stored here is authoritative: worker records live only as long as
/// their lease, and counters can always be recomputed from the [`Ledger`].
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Lists live keys starting with `prefix`, one page at a time.
    async fn list(
        &self,
        prefix: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>), CacheError>;

    /// Atomically adds `delta` to the integer at `key` and returns the new
    /// value. A missing key counts as zero.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CacheError>;
}

/// Durable source of truth for jobs and resource allocations.
///
/// Implementations must keep at most one non-released allocation per job and
/// must apply `reserve` and `abandon_reservation` atomically.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert a new job in the pending state.
    async fn insert_job(&self, spec: JobSpec) -> Result<JobRecord, LedgerError>;

    async fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>, LedgerError>;

    /// Pending jobs in submission order.
    async fn pending_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, LedgerError>;

    /// Insert a reserved allocation and flip the job from pending to running.
    async fn reserve(&self, id: &JobId, cpus: u32) -> Result<Allocation, LedgerError>;

    /// Release a reserved allocation and put the job back to pending.
    async fn abandon_reservation(&self, id: &JobId) -> Result<(), LedgerError>;

    /// Transition the job's reserved allocation to allocated.
    async fn promote(&self, id: &JobId) -> Result<Allocation, LedgerError>;

    /// Record the owning process, and the host it runs on, on the job's
    /// live allocation.
    async fn attach_process(&self, id: &JobId, pid: u32, host: &str) -> Result<(), LedgerError>;

    /// Release the job's live allocation.
    ///
    /// Returns the allocation as it was before the release, or `None` when
    /// there was nothing live to release.
    async fn release(&self, id: &JobId) -> Result<Option<Allocation>, LedgerError>;

    async fn active_allocation(&self, id: &JobId) -> Result<Option<Allocation>, LedgerError>;

    /// Sum of CPUs across allocated (not reserved) rows.
    async fn sum_allocated(&self) -> Result<u64, LedgerError>;

    /// Write a terminal state unless the job is already terminal.
    ///
    /// Returns `true` if this call performed the transition.
    async fn finish_job(
        &self,
        id: &JobId,
        state: JobState,
        exit_code: Option<i32>,
        error: Option<&str>,
    ) -> Result<bool, LedgerError>;

    /// Reserved allocations made before `cutoff` whose job is still running.
    async fn stale_reservations(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Allocation>, LedgerError>;

    /// Running jobs that started before `cutoff`.
    async fn orphaned_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobRecord>, LedgerError>;
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn publish(&self, queue: &str, message: &[u8]) -> Result<MessageId, QueueError>;

    async fn receive(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Message>, QueueError>;

    async fn ack(&self, queue: &str, message_id: &MessageId) -> Result<(), QueueError>;

    /// Number of messages waiting in the queue, visible or not.
    async fn depth(&self, queue: &str) -> Result<usize, QueueError>;
}
