//! Worker liveness records.
//!
//! A worker is live exactly while its record exists in the cache. The record
//! is written with a lease and rewritten on every heartbeat; a crashed worker
//! simply stops renewing and the record expires.

use std::sync::Arc;
use std::time::Duration;

use armada_state::CacheBackend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};

/// Key prefix for worker liveness records.
pub const WORKER_KEY_PREFIX: &str = "worker:";

const SCAN_PAGE: usize = 100;

/// Unique worker identifier.
pub type WorkerId = String;

/// Cache key holding a worker's record.
pub fn worker_key(worker_id: &str) -> String {
    format!("{WORKER_KEY_PREFIX}{worker_id}")
}

/// Worker status as advertised in its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Accepting dispatches; counts towards cluster capacity.
    Active,
    /// Finishing in-flight jobs before shutdown; excluded from capacity.
    Draining,
}

/// Liveness record stored under `worker:{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub cpus: u32,
    pub status: WorkerStatus,
    pub hostname: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerRecord {
    /// Whether this worker's CPUs count towards cluster capacity.
    pub const fn is_schedulable(&self) -> bool {
        match self.status {
            WorkerStatus::Active => true,
            WorkerStatus::Draining => false,
        }
    }
}

/// A single worker's registration in the liveness cache.
pub struct WorkerRegistry {
    cache: Arc<dyn CacheBackend>,
    lease: Duration,
    record: RwLock<Option<WorkerRecord>>,
}

impl WorkerRegistry {
    /// Creates a registry writing records with the given lease.
    pub fn new(cache: Arc<dyn CacheBackend>, lease: Duration) -> Self {
        Self {
            cache,
            lease,
            record: RwLock::new(None),
        }
    }

    /// Writes this worker's record and starts its lease.
    pub async fn register(
        &self,
        worker_id: impl Into<WorkerId>,
        cpus: u32,
        hostname: impl Into<String>,
    ) -> Result<WorkerRecord> {
        let now = Utc::now();
        let record = WorkerRecord {
            worker_id: worker_id.into(),
            cpus,
            status: WorkerStatus::Active,
            hostname: hostname.into(),
            registered_at: now,
            last_heartbeat: now,
        };

        self.write(&record).await?;
        info!(
            worker_id = %record.worker_id,
            cpus = record.cpus,
            hostname = %record.hostname,
            lease_secs = self.lease.as_secs(),
            "worker registered"
        );

        *self.record.write().await = Some(record.clone());
        Ok(record)
    }

    /// Rewrites the record and resets its lease.
    ///
    /// Also restores a record that vanished from the cache while this worker
    /// was still alive.
    pub async fn heartbeat(&self) -> Result<()> {
        let mut guard = self.record.write().await;
        let record = guard.as_mut().ok_or(SchedulerError::NotRegistered)?;
        record.last_heartbeat = Utc::now();
        self.write(record).await?;
        debug!(worker_id = %record.worker_id, "heartbeat");
        Ok(())
    }

    /// Marks the worker as draining so it stops counting towards capacity.
    pub async fn mark_draining(&self) -> Result<()> {
        let mut guard = self.record.write().await;
        let record = guard.as_mut().ok_or(SchedulerError::NotRegistered)?;
        record.status = WorkerStatus::Draining;
        record.last_heartbeat = Utc::now();
        self.write(record).await?;
        info!(worker_id = %record.worker_id, "worker draining");
        Ok(())
    }

    /// Removes the record. Best effort.
    pub async fn deregister(&self) -> Result<()> {
        let record = self
            .record
            .write()
            .await
            .take()
            .ok_or(SchedulerError::NotRegistered)?;
        self.cache.delete(&worker_key(&record.worker_id)).await?;
        info!(worker_id = %record.worker_id, "worker deregistered");
        Ok(())
    }

    /// The record as last written by this registry.
    pub async fn current(&self) -> Option<WorkerRecord> {
        self.record.read().await.clone()
    }

    /// Renews the lease every `interval` until `cancel` fires.
    ///
    /// Failures are logged and retried on the next tick; a missed renewal
    /// only matters if every renewal within one lease fails.
    pub async fn run_heartbeat(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(error = %e, "heartbeat failed");
                    }
                }
            }
        }
    }

    async fn write(&self, record: &WorkerRecord) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        self.cache
            .put(&worker_key(&record.worker_id), &value, Some(self.lease))
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

/// All worker records currently present in the cache.
///
/// Records that expire mid-scan are skipped. Records that fail to decode are
/// logged and skipped.
pub async fn live_workers(cache: &dyn CacheBackend) -> Result<Vec<WorkerRecord>> {
    let mut workers = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let (keys, next) = cache
            .list(WORKER_KEY_PREFIX, SCAN_PAGE, cursor.as_deref())
            .await?;

        for key in keys {
            let Some(bytes) = cache.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<WorkerRecord>(&bytes) {
                Ok(record) => workers.push(record),
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable worker record"),
            }
        }

        match next {
            Some(c) => cursor = Some(c),
            None => break,
        }
    }

    Ok(workers)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use armada_state::MemoryCache;

    fn registry(cache: &Arc<MemoryCache>) -> WorkerRegistry {
        WorkerRegistry::new(cache.clone(), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn register_writes_record() {
        let cache = Arc::new(MemoryCache::new());
        let registry = registry(&cache);

        let record = registry.register("w1", 96, "node-1").await.unwrap();
        assert_eq!(record.status, WorkerStatus::Active);

        let workers = live_workers(cache.as_ref()).await.unwrap();
        assert_eq!(workers, vec![record]);
    }

    #[tokio::test]
    async fn heartbeat_requires_registration() {
        let cache = Arc::new(MemoryCache::new());
        let registry = registry(&cache);

        assert!(matches!(
            registry.heartbeat().await,
            Err(SchedulerError::NotRegistered)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn record_expires_without_heartbeat() {
        let cache = Arc::new(MemoryCache::new());
        let registry = registry(&cache);
        registry.register("w1", 8, "node-1").await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(live_workers(cache.as_ref()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_extends_lease() {
        let cache = Arc::new(MemoryCache::new());
        let registry = registry(&cache);
        registry.register("w1", 8, "node-1").await.unwrap();

        tokio::time::advance(Duration::from_secs(40)).await;
        registry.heartbeat().await.unwrap();
        tokio::time::advance(Duration::from_secs(40)).await;

        assert_eq!(live_workers(cache.as_ref()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_restores_lost_record() {
        let cache = Arc::new(MemoryCache::new());
        let registry = registry(&cache);
        registry.register("w1", 8, "node-1").await.unwrap();

        cache.delete(&worker_key("w1")).await.unwrap();
        registry.heartbeat().await.unwrap();

        assert!(cache.exists(&worker_key("w1")).await.unwrap());
    }

    #[tokio::test]
    async fn draining_record_is_not_schedulable() {
        let cache = Arc::new(MemoryCache::new());
        let registry = registry(&cache);
        registry.register("w1", 8, "node-1").await.unwrap();
        registry.mark_draining().await.unwrap();

        let workers = live_workers(cache.as_ref()).await.unwrap();
        assert_eq!(workers.len(), 1);
        assert!(!workers[0].is_schedulable());
    }

    #[tokio::test]
    async fn deregister_removes_record() {
        let cache = Arc::new(MemoryCache::new());
        let registry = registry(&cache);
        registry.register("w1", 8, "node-1").await.unwrap();

        registry.deregister().await.unwrap();
        assert!(live_workers(cache.as_ref()).await.unwrap().is_empty());
        assert!(registry.current().await.is_none());
    }

    #[tokio::test]
    async fn scan_skips_corrupt_records() {
        let cache = Arc::new(MemoryCache::new());
        registry(&cache).register("w1", 8, "node-1").await.unwrap();
        cache.put("worker:bad", b"not json", None).await.unwrap();

        let workers = live_workers(cache.as_ref()).await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].worker_id, "w1");
    }

    #[tokio::test]
    async fn scan_pages_through_many_workers() {
        let cache = Arc::new(MemoryCache::new());
        for i in 0..250 {
            registry(&cache)
                .register(format!("w{i}"), 1, "node")
                .await
                .unwrap();
        }

        assert_eq!(live_workers(cache.as_ref()).await.unwrap().len(), 250);
    }
}
