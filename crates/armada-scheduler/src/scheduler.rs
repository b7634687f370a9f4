//! The scheduling loop.
//!
//! Each tick reads cluster capacity, walks pending jobs in submission order
//! and reserves every job that fits in what is left. Reserved jobs are
//! published to the work queue for a worker to pick up.

use std::time::Duration;

use armada_state::{JobId, JobRecord, JobState, LedgerError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accountant::{CapacitySnapshot, ResourceAccountant};
use crate::error::{Result, SchedulerError};
use crate::queue::{JobDispatch, WorkQueue};

/// What a single tick saw and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Capacity at the start of the tick. `None` when no workers were live.
    pub capacity: Option<CapacitySnapshot>,
    /// Jobs reserved and published, in order.
    pub reserved: Vec<JobId>,
    /// Jobs that did not fit this tick.
    pub deferred: Vec<JobId>,
    /// Jobs failed because they can never fit.
    pub rejected: Vec<JobId>,
    /// Jobs whose reservation was rolled back after publishing failed.
    pub requeued: Vec<JobId>,
    /// Allocated exceeded total at the start of the tick.
    pub drift: bool,
}

impl TickReport {
    /// True when the tick was skipped for lack of live workers.
    pub const fn skipped(&self) -> bool {
        self.capacity.is_none()
    }
}

/// Matches pending jobs against available CPUs.
#[derive(Debug, Clone)]
pub struct Scheduler {
    accountant: ResourceAccountant,
    queue: WorkQueue,
    batch_size: usize,
}

impl Scheduler {
    pub fn new(accountant: ResourceAccountant, queue: WorkQueue, batch_size: usize) -> Self {
        Self {
            accountant,
            queue,
            batch_size,
        }
    }

    /// Run one scheduling pass.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();

        let total = self.accountant.total_capacity().await?;
        if total == 0 {
            debug!("no live workers, skipping tick");
            return Ok(report);
        }

        let allocated = self.accountant.allocated_capacity().await?;
        let snapshot = CapacitySnapshot::new(total, allocated);
        report.capacity = Some(snapshot);

        if snapshot.drift {
            report.drift = true;
            warn!(
                anomaly = "cache_drift",
                total, allocated, "allocated exceeds capacity, scheduling nothing this tick"
            );
            if let Err(e) = self.accountant.resync_cache().await {
                warn!(error = %e, "resync after drift failed");
            }
        }

        let mut available = snapshot.available;
        let pending = self.accountant.ledger().pending_jobs(self.batch_size).await?;

        for job in pending {
            let cpus = job.spec.cpus_required;
            let needed = u64::from(cpus);

            if needed > total {
                self.reject(&job, total).await?;
                report.rejected.push(job.id);
                continue;
            }

            if needed > available {
                report.deferred.push(job.id);
                continue;
            }

            match self.accountant.reserve(&job.id, cpus).await {
                Ok(_) => {}
                Err(SchedulerError::Ledger(LedgerError::AllocationConflict(id))) => {
                    warn!(
                        anomaly = "allocation_conflict",
                        job_id = %id,
                        "pending job already holds a live allocation"
                    );
                    continue;
                }
                Err(SchedulerError::Ledger(LedgerError::JobNotPending { job_id, state })) => {
                    debug!(job_id = %job_id, state = %state, "job left pending before reservation");
                    continue;
                }
                Err(e) => return Err(e),
            }

            if let Err(e) = self.queue.publish(&JobDispatch::from_job(&job)).await {
                warn!(job_id = %job.id, error = %e, "publish failed, rolling back reservation");
                if let Err(e) = self.accountant.ledger().abandon_reservation(&job.id).await {
                    warn!(
                        job_id = %job.id,
                        error = %e,
                        "rollback failed, reaper will resolve the reservation"
                    );
                }
                report.requeued.push(job.id);
                // The queue is unlikely to accept the next job either.
                break;
            }

            available -= needed;
            info!(job_id = %job.id, cpus, available, "job scheduled");
            report.reserved.push(job.id);
        }

        Ok(report)
    }

    /// Tick every `interval` until `cancel` fires.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        info!(
            interval_secs = interval.as_secs(),
            queue = %self.queue.name(),
            "scheduler loop started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                _ = ticker.tick() => match self.tick().await {
                    Ok(report) if !report.reserved.is_empty() || !report.rejected.is_empty() => {
                        info!(
                            reserved = report.reserved.len(),
                            deferred = report.deferred.len(),
                            rejected = report.rejected.len(),
                            "tick complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "tick failed, retrying next interval"),
                },
            }
        }

        info!("scheduler loop stopped");
    }

    async fn reject(&self, job: &JobRecord, total: u64) -> Result<()> {
        let message = format!(
            "requires {} cpus but cluster capacity is {total}",
            job.spec.cpus_required
        );
        warn!(job_id = %job.id, cpus = job.spec.cpus_required, total, "job can never be scheduled");
        self.accountant
            .ledger()
            .finish_job(&job.id, JobState::Failed, None, Some(&message))
            .await?;
        Ok(())
    }
}
