//! CPU accounting across the cache and the ledger.
//!
//! The ledger is authoritative. The cache holds a single counter, the sum of
//! CPUs on ALLOCATED rows, which is charged on promotion, discharged on
//! release of an ALLOCATED row, and periodically overwritten from the ledger
//! to correct drift. Reservations never touch the counter.

use std::sync::Arc;
use std::time::Duration;

use armada_state::{Allocation, AllocationStatus, CacheBackend, JobId, Ledger};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::live_workers;

/// Cache key of the allocated-CPU counter.
pub const ALLOCATED_CPUS_KEY: &str = "resource:allocated_cpus";

/// Capacity as seen at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacitySnapshot {
    /// Sum of CPUs over live, active workers.
    pub total: u64,
    /// CPUs on allocated rows.
    pub allocated: u64,
    /// `total - allocated`, clamped at zero.
    pub available: u64,
    /// Set when `allocated` exceeded `total`.
    pub drift: bool,
}

impl CapacitySnapshot {
    pub(crate) const fn new(total: u64, allocated: u64) -> Self {
        Self {
            total,
            allocated,
            available: total.saturating_sub(allocated),
            drift: allocated > total,
        }
    }
}

/// Applies allocation transitions to the ledger and the cached counter.
#[derive(Clone)]
pub struct ResourceAccountant {
    cache: Arc<dyn CacheBackend>,
    ledger: Arc<dyn Ledger>,
}

impl ResourceAccountant {
    pub fn new(cache: Arc<dyn CacheBackend>, ledger: Arc<dyn Ledger>) -> Self {
        Self { cache, ledger }
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn cache(&self) -> &Arc<dyn CacheBackend> {
        &self.cache
    }

    /// Sum of advertised CPUs across live, non-draining workers.
    pub async fn total_capacity(&self) -> Result<u64> {
        let workers = live_workers(self.cache.as_ref()).await?;
        Ok(workers
            .iter()
            .filter(|w| w.is_schedulable())
            .map(|w| u64::from(w.cpus))
            .sum())
    }

    /// CPUs currently allocated.
    ///
    /// Reads the cached counter. When the counter is missing, unreadable or
    /// the cache is down, the value is recomputed from the ledger and written
    /// back.
    pub async fn allocated_capacity(&self) -> Result<u64> {
        match self.cache.get(ALLOCATED_CPUS_KEY).await {
            Ok(Some(bytes)) => match parse_counter(&bytes) {
                Some(value) => match u64::try_from(value) {
                    Ok(allocated) => return Ok(allocated),
                    Err(_) => warn!(
                        anomaly = "cache_drift",
                        value, "cached allocated counter is negative"
                    ),
                },
                None => warn!("cached allocated counter is not an integer"),
            },
            Ok(None) => debug!("allocated counter missing from cache"),
            Err(e) => warn!(error = %e, "cache read failed, using ledger"),
        }

        let allocated = self.ledger.sum_allocated().await?;
        if let Err(e) = self.write_counter(allocated).await {
            warn!(error = %e, "failed to repopulate allocated counter");
        }
        Ok(allocated)
    }

    /// Total, allocated and available CPUs.
    pub async fn snapshot(&self) -> Result<CapacitySnapshot> {
        let total = self.total_capacity().await?;
        let allocated = self.allocated_capacity().await?;
        Ok(CapacitySnapshot::new(total, allocated))
    }

    /// Reserve capacity for a job. Ledger only.
    pub async fn reserve(&self, job_id: &JobId, cpus: u32) -> Result<Allocation> {
        let allocation = self.ledger.reserve(job_id, cpus).await?;
        debug!(job_id = %job_id, cpus, "reserved");
        Ok(allocation)
    }

    /// Promote the job's reservation and charge the cached counter.
    ///
    /// The ledger transition is the commit point. A failed cache charge is
    /// logged and left to resync.
    pub async fn promote(&self, job_id: &JobId) -> Result<Allocation> {
        let allocation = self.ledger.promote(job_id).await?;

        let delta = i64::from(allocation.allocated_cpus);
        match self.cache.incr_by(ALLOCATED_CPUS_KEY, delta).await {
            Ok(counter) => debug!(job_id = %job_id, cpus = delta, counter, "allocated"),
            Err(e) => warn!(
                job_id = %job_id,
                error = %e,
                "failed to charge allocated counter, resync will correct"
            ),
        }

        Ok(allocation)
    }

    /// Release the job's live allocation.
    ///
    /// Idempotent. The counter is discharged only when the released row was
    /// ALLOCATED, and only by the caller whose release moved it.
    pub async fn release(&self, job_id: &JobId) -> Result<Option<Allocation>> {
        let Some(prior) = self.ledger.release(job_id).await? else {
            debug!(job_id = %job_id, "nothing to release");
            return Ok(None);
        };

        match prior.status {
            AllocationStatus::Allocated => {
                let delta = -i64::from(prior.allocated_cpus);
                match self.cache.incr_by(ALLOCATED_CPUS_KEY, delta).await {
                    Ok(counter) if counter < 0 => warn!(
                        anomaly = "cache_drift",
                        job_id = %job_id,
                        counter,
                        "allocated counter went negative"
                    ),
                    Ok(counter) => debug!(job_id = %job_id, counter, "released allocation"),
                    Err(e) => warn!(
                        job_id = %job_id,
                        error = %e,
                        "failed to discharge allocated counter, resync will correct"
                    ),
                }
            }
            AllocationStatus::Reserved => {
                debug!(job_id = %job_id, "released reservation");
            }
            AllocationStatus::Released => {
                warn!(
                    anomaly = "unexpected_status",
                    job_id = %job_id,
                    "ledger returned an already released row as live"
                );
            }
        }

        Ok(Some(prior))
    }

    /// Overwrite the cached counter with the ledger's sum.
    pub async fn resync_cache(&self) -> Result<u64> {
        let allocated = self.ledger.sum_allocated().await?;
        self.write_counter(allocated).await?;
        debug!(allocated, "allocated counter resynced");
        Ok(allocated)
    }

    /// Resync every `interval` until `cancel` fires.
    pub async fn run_resync(&self, interval: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "cache resync loop started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    if let Err(e) = self.resync_cache().await {
                        warn!(error = %e, "cache resync failed");
                    }
                }
            }
        }

        info!("cache resync loop stopped");
    }

    async fn write_counter(&self, value: u64) -> Result<()> {
        self.cache
            .put(ALLOCATED_CPUS_KEY, value.to_string().as_bytes(), None)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for ResourceAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceAccountant").finish_non_exhaustive()
    }
}

fn parse_counter(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}
