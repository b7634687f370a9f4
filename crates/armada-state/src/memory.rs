use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{CacheError, LedgerError, QueueError};
use crate::traits::{CacheBackend, Ledger, QueueBackend};
use crate::types::{
    Allocation, AllocationStatus, JobId, JobRecord, JobSpec, JobState, Message, MessageId,
};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |exp| now < exp)
    }
}

/// In-memory cache with per-key expiry.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    data: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let data = self.data.read().await;
        match data.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => Ok(Some(entry.value.clone())),
            Some(_) => {
                drop(data);
                let mut data = self.data.write().await;
                data.remove(key);
                trace!(key, "evicted expired key");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut data = self.data.write().await;
        let expires_at = ttl.map(|d| Instant::now() + d);
        data.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut data = self.data.write().await;
        Ok(data
            .remove(key)
            .is_some_and(|entry| entry.is_live(Instant::now())))
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let data = self.data.read().await;
        Ok(data
            .get(key)
            .is_some_and(|entry| entry.is_live(Instant::now())))
    }

    async fn list(
        &self,
        prefix: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>), CacheError> {
        let data = self.data.read().await;
        let now = Instant::now();

        let mut keys: Vec<_> = data
            .iter()
            .filter(|(k, entry)| {
                k.starts_with(prefix)
                    && entry.is_live(now)
                    && cursor.map_or(true, |c| k.as_str() > c)
            })
            .map(|(k, _)| k.clone())
            .collect();

        keys.sort();

        // The cursor is the last key handed out, so the next page starts
        // strictly after it.
        let next_cursor = if keys.len() > limit {
            keys.truncate(limit);
            keys.last().cloned()
        } else {
            None
        };

        Ok((keys, next_cursor))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let mut data = self.data.write().await;
        let now = Instant::now();

        let (current, expires_at) = match data.get(key) {
            Some(entry) if entry.is_live(now) => {
                let text = std::str::from_utf8(&entry.value).map_err(|_| {
                    CacheError::NotAnInteger {
                        key: key.to_owned(),
                    }
                })?;
                let value = text.trim().parse::<i64>().map_err(|_| CacheError::NotAnInteger {
                    key: key.to_owned(),
                })?;
                (value, entry.expires_at)
            }
            _ => (0, None),
        };

        let updated = current.checked_add(delta).ok_or_else(|| {
            warn!(key, current, delta, "counter increment overflows");
            CacheError::NotAnInteger {
                key: key.to_owned(),
            }
        })?;
        data.insert(
            key.to_string(),
            CacheEntry {
                value: updated.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok(updated)
    }
}

#[derive(Debug, Default)]
struct LedgerTables {
    jobs: HashMap<JobId, JobRecord>,
    /// Submission order, used for FIFO scans of pending jobs.
    order: Vec<JobId>,
    allocations: Vec<Allocation>,
    next_allocation_id: i64,
}

impl LedgerTables {
    fn live_allocation_mut(&mut self, id: &JobId) -> Option<&mut Allocation> {
        self.allocations
            .iter_mut()
            .find(|a| &a.job_id == id && a.status.is_live())
    }

    fn live_allocation(&self, id: &JobId) -> Option<&Allocation> {
        self.allocations
            .iter()
            .find(|a| &a.job_id == id && a.status.is_live())
    }
}

/// In-memory ledger.
///
/// A single lock guards both tables, so every operation is trivially
/// transactional.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    tables: Arc<RwLock<LedgerTables>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// All allocation rows ever written for a job, oldest first.
    pub async fn allocations_for(&self, id: &JobId) -> Vec<Allocation> {
        let tables = self.tables.read().await;
        tables
            .allocations
            .iter()
            .filter(|a| &a.job_id == id)
            .cloned()
            .collect()
    }

    /// Rewrites the timestamps of a job's live allocation and start time.
    ///
    /// Lets sweeps over old rows be exercised without waiting in real time.
    pub async fn backdate(&self, id: &JobId, by: chrono::Duration) {
        let mut tables = self.tables.write().await;
        if let Some(job) = tables.jobs.get_mut(id) {
            job.start_time = job.start_time.map(|t| t - by);
        }
        if let Some(allocation) = tables.live_allocation_mut(id) {
            allocation.allocation_time -= by;
            allocation.allocated_time = allocation.allocated_time.map(|t| t - by);
        }
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert_job(&self, spec: JobSpec) -> Result<JobRecord, LedgerError> {
        spec.validate().map_err(LedgerError::InvalidJob)?;

        let mut tables = self.tables.write().await;
        let record = JobRecord::pending(JobId::generate(), spec);
        tables.order.push(record.id.clone());
        tables.jobs.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>, LedgerError> {
        let tables = self.tables.read().await;
        Ok(tables.jobs.get(id).cloned())
    }

    async fn pending_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, LedgerError> {
        let tables = self.tables.read().await;
        Ok(tables
            .order
            .iter()
            .filter_map(|id| tables.jobs.get(id))
            .filter(|job| job.state == JobState::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn reserve(&self, id: &JobId, cpus: u32) -> Result<Allocation, LedgerError> {
        let mut tables = self.tables.write().await;

        let state = tables
            .jobs
            .get(id)
            .map(|job| job.state)
            .ok_or_else(|| LedgerError::JobNotFound(id.clone()))?;

        if state != JobState::Pending {
            return Err(LedgerError::JobNotPending {
                job_id: id.clone(),
                state,
            });
        }

        if tables.live_allocation(id).is_some() {
            return Err(LedgerError::AllocationConflict(id.clone()));
        }

        let now = Utc::now();
        tables.next_allocation_id += 1;
        let allocation = Allocation {
            id: tables.next_allocation_id,
            job_id: id.clone(),
            allocated_cpus: cpus,
            status: AllocationStatus::Reserved,
            allocation_time: now,
            allocated_time: None,
            released_time: None,
            process_id: None,
            process_host: None,
        };
        tables.allocations.push(allocation.clone());

        if let Some(job) = tables.jobs.get_mut(id) {
            job.state = JobState::Running;
            job.start_time = Some(now);
        }

        Ok(allocation)
    }

    async fn abandon_reservation(&self, id: &JobId) -> Result<(), LedgerError> {
        let mut tables = self.tables.write().await;

        let allocation = tables.live_allocation_mut(id);
        let found = allocation.as_ref().map(|a| a.status);
        match allocation {
            Some(allocation) if allocation.status == AllocationStatus::Reserved => {
                allocation.status = AllocationStatus::Released;
                allocation.released_time = Some(Utc::now());
            }
            _ => {
                return Err(LedgerError::NotReserved {
                    job_id: id.clone(),
                    found,
                })
            }
        }

        if let Some(job) = tables.jobs.get_mut(id) {
            if job.state == JobState::Running {
                job.state = JobState::Pending;
                job.start_time = None;
            }
        }
        Ok(())
    }

    async fn promote(&self, id: &JobId) -> Result<Allocation, LedgerError> {
        let mut tables = self.tables.write().await;

        match tables.live_allocation_mut(id) {
            Some(allocation) if allocation.status == AllocationStatus::Reserved => {
                allocation.status = AllocationStatus::Allocated;
                allocation.allocated_time = Some(Utc::now());
                Ok(allocation.clone())
            }
            other => Err(LedgerError::NotReserved {
                job_id: id.clone(),
                found: other.map(|a| a.status),
            }),
        }
    }

    async fn attach_process(&self, id: &JobId, pid: u32, host: &str) -> Result<(), LedgerError> {
        let mut tables = self.tables.write().await;
        let allocation = tables
            .live_allocation_mut(id)
            .ok_or_else(|| LedgerError::NotReserved {
                job_id: id.clone(),
                found: None,
            })?;
        allocation.process_id = Some(pid);
        allocation.process_host = Some(host.to_owned());
        Ok(())
    }

    async fn release(&self, id: &JobId) -> Result<Option<Allocation>, LedgerError> {
        let mut tables = self.tables.write().await;
        Ok(tables.live_allocation_mut(id).map(|allocation| {
            let prior = allocation.clone();
            allocation.status = AllocationStatus::Released;
            allocation.released_time = Some(Utc::now());
            prior
        }))
    }

    async fn active_allocation(&self, id: &JobId) -> Result<Option<Allocation>, LedgerError> {
        let tables = self.tables.read().await;
        Ok(tables.live_allocation(id).cloned())
    }

    async fn sum_allocated(&self) -> Result<u64, LedgerError> {
        let tables = self.tables.read().await;
        Ok(tables
            .allocations
            .iter()
            .filter(|a| a.status == AllocationStatus::Allocated)
            .map(|a| u64::from(a.allocated_cpus))
            .sum())
    }

    async fn finish_job(
        &self,
        id: &JobId,
        state: JobState,
        exit_code: Option<i32>,
        error: Option<&str>,
    ) -> Result<bool, LedgerError> {
        let mut tables = self.tables.write().await;
        let job = tables
            .jobs
            .get_mut(id)
            .ok_or_else(|| LedgerError::JobNotFound(id.clone()))?;

        if job.state.is_terminal() {
            return Ok(false);
        }

        job.state = state;
        job.end_time = Some(Utc::now());
        job.exit_code = exit_code;
        job.error_msg = error.map(ToOwned::to_owned);
        Ok(true)
    }

    async fn stale_reservations(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Allocation>, LedgerError> {
        let tables = self.tables.read().await;
        Ok(tables
            .allocations
            .iter()
            .filter(|a| a.status == AllocationStatus::Reserved && a.allocation_time < cutoff)
            .filter(|a| {
                tables
                    .jobs
                    .get(&a.job_id)
                    .is_some_and(|job| job.state == JobState::Running)
            })
            .cloned()
            .collect())
    }

    async fn orphaned_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobRecord>, LedgerError> {
        let tables = self.tables.read().await;
        Ok(tables
            .order
            .iter()
            .filter_map(|id| tables.jobs.get(id))
            .filter(|job| {
                job.state == JobState::Running && job.start_time.is_some_and(|t| t < cutoff)
            })
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone)]
struct QueueEntry {
    message: Message,
    visible_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    queues: Arc<Mutex<HashMap<String, VecDeque<QueueEntry>>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every message in `queue`, as a lost or flushed broker would.
    pub async fn purge(&self, queue: &str) -> usize {
        let mut queues = self.queues.lock().await;
        queues.remove(queue).map_or(0, |q| q.len())
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn publish(&self, queue: &str, message: &[u8]) -> Result<MessageId, QueueError> {
        let mut queues = self.queues.lock().await;
        let queue_data = queues.entry(queue.to_string()).or_default();

        let id = MessageId::new(Uuid::new_v4().to_string());
        queue_data.push_back(QueueEntry {
            message: Message {
                id: id.clone(),
                payload: message.to_vec(),
                attempt: 0,
                enqueued_at: SystemTime::now(),
            },
            visible_at: Instant::now(),
        });
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Message>, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(queue_data) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let now = Instant::now();
        for entry in queue_data.iter_mut() {
            if entry.visible_at <= now {
                entry.visible_at = now + visibility_timeout;
                entry.message.attempt += 1;
                if entry.message.attempt > 1 {
                    debug!(
                        queue,
                        message_id = %entry.message.id,
                        attempt = entry.message.attempt,
                        "redelivering message after visibility timeout"
                    );
                }
                return Ok(Some(entry.message.clone()));
            }
        }

        Ok(None)
    }

    async fn ack(&self, queue: &str, message_id: &MessageId) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let queue_data = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;

        let initial_len = queue_data.len();
        queue_data.retain(|entry| entry.message.id != *message_id);

        if queue_data.len() == initial_len {
            return Err(QueueError::MessageNotFound(message_id.to_string()));
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<usize, QueueError> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map_or(0, VecDeque::len))
    }
}
