//! Sweeps for allocations and jobs stuck by lost signals.
//!
//! Both sweeps read the ledger only. A reservation that outlives
//! `stale_reservation` almost certainly lost its dispatch; a job running
//! longer than `orphan_after` almost certainly lost its executor.

use std::time::Duration;

use armada_state::{JobId, JobState};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::accountant::ResourceAccountant;
use crate::config::ReaperConfig;
use crate::error::Result;

/// Error recorded on jobs whose dispatch never reached a worker.
pub const QUEUE_LOST: &str = "queue lost before execution";
/// Error recorded on jobs whose executor disappeared.
pub const EXECUTION_ORPHANED: &str = "execution orphaned";

/// Jobs resolved by one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub stale_reservations: Vec<JobId>,
    pub orphaned: Vec<JobId>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.stale_reservations.is_empty() && self.orphaned.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Reaper {
    accountant: ResourceAccountant,
    stale_reservation: Duration,
    orphan_after: Duration,
}

impl Reaper {
    pub fn new(accountant: ResourceAccountant, config: &ReaperConfig) -> Self {
        Self {
            accountant,
            stale_reservation: config.stale_reservation,
            orphan_after: config.orphan_after,
        }
    }

    /// Run both sweeps. A failing sweep does not stop the other.
    pub async fn sweep(&self) -> ReapReport {
        let stale_reservations = self.sweep_stale_reservations().await.unwrap_or_else(|e| {
            warn!(error = %e, "stale reservation sweep failed");
            Vec::new()
        });
        let orphaned = self.sweep_orphans().await.unwrap_or_else(|e| {
            warn!(error = %e, "orphan sweep failed");
            Vec::new()
        });

        ReapReport {
            stale_reservations,
            orphaned,
        }
    }

    /// Fail jobs whose reservation is older than the stale threshold.
    ///
    /// Reserved rows never charged the cached counter, so releasing them
    /// leaves it unchanged.
    pub async fn sweep_stale_reservations(&self) -> Result<Vec<JobId>> {
        let ledger = self.accountant.ledger();
        let stale = ledger
            .stale_reservations(cutoff(self.stale_reservation))
            .await?;

        let mut reaped = Vec::with_capacity(stale.len());
        for allocation in stale {
            let job_id = allocation.job_id;
            ledger
                .finish_job(&job_id, JobState::Failed, None, Some(QUEUE_LOST))
                .await?;
            self.accountant.release(&job_id).await?;
            warn!(
                job_id = %job_id,
                reserved_at = %allocation.allocation_time,
                "reaped stale reservation"
            );
            reaped.push(job_id);
        }
        Ok(reaped)
    }

    /// Fail jobs that have been running longer than the orphan threshold.
    pub async fn sweep_orphans(&self) -> Result<Vec<JobId>> {
        let ledger = self.accountant.ledger();
        let orphans = ledger.orphaned_jobs(cutoff(self.orphan_after)).await?;

        let mut reaped = Vec::with_capacity(orphans.len());
        for job in orphans {
            ledger
                .finish_job(&job.id, JobState::Failed, None, Some(EXECUTION_ORPHANED))
                .await?;
            self.accountant.release(&job.id).await?;
            warn!(
                job_id = %job.id,
                started_at = ?job.start_time,
                "reaped orphaned job"
            );
            reaped.push(job.id);
        }
        Ok(reaped)
    }

    /// Sweep every `interval` until `cancel` fires.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "reaper started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if !report.is_empty() {
                        info!(
                            stale_reservations = report.stale_reservations.len(),
                            orphaned = report.orphaned.len(),
                            "reaper sweep complete"
                        );
                    }
                }
            }
        }

        info!("reaper stopped");
    }
}

fn cutoff(age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_is_in_the_past() {
        assert!(cutoff(Duration::from_secs(60)) < Utc::now());
    }

    #[test]
    fn huge_age_saturates() {
        assert_eq!(cutoff(Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }
}
