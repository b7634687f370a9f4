//! Cross-process cancellation.
//!
//! A cancel request is a flag in the cache with a bounded lifetime. The
//! executor owning the job polls for it; the requesting side waits for the
//! ledger to show a terminal state and kills the process group itself if
//! the executor does not respond in time.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use armada_state::{CacheBackend, JobId, JobState};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::accountant::ResourceAccountant;
use crate::config::CancelConfig;
use crate::error::Result;
use crate::terminator::{local_hostname, ProcessTreeTerminator, TERMINATED_EXIT_CODE};

/// Key prefix for cancellation flags.
pub const CANCEL_KEY_PREFIX: &str = "job:cancel:";

pub fn cancel_key(job_id: &JobId) -> String {
    format!("{CANCEL_KEY_PREFIX}{job_id}")
}

/// TTL-bounded "please stop" flag keyed by job.
#[derive(Clone)]
pub struct CancellationSignal {
    cache: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl CancellationSignal {
    pub fn new(cache: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub async fn request_cancel(&self, job_id: &JobId) -> Result<()> {
        self.cache
            .put(&cancel_key(job_id), b"1", Some(self.ttl))
            .await?;
        Ok(())
    }

    pub async fn is_cancelled(&self, job_id: &JobId) -> Result<bool> {
        Ok(self.cache.exists(&cancel_key(job_id)).await?)
    }

    pub async fn clear(&self, job_id: &JobId) -> Result<()> {
        self.cache.delete(&cancel_key(job_id)).await?;
        Ok(())
    }
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The job runs on another host. The flag stays set for its executor.
    Requested,
    NotFound,
    AlreadyTerminal,
}

impl CancelOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Requested => "requested",
            Self::NotFound => "not_found",
            Self::AlreadyTerminal => "already_terminal",
        }
    }
}

impl fmt::Display for CancelOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission-side cancel operation.
#[derive(Debug, Clone)]
pub struct JobCanceller {
    accountant: ResourceAccountant,
    signal: CancellationSignal,
    terminator: ProcessTreeTerminator,
    window: Duration,
    poll_interval: Duration,
    grace_period: Duration,
    hostname: String,
}

impl JobCanceller {
    pub fn new(
        accountant: ResourceAccountant,
        signal: CancellationSignal,
        terminator: ProcessTreeTerminator,
        config: &CancelConfig,
        grace_period: Duration,
    ) -> Self {
        Self {
            accountant,
            signal,
            terminator,
            window: config.window,
            poll_interval: config.poll_interval,
            grace_period,
            hostname: local_hostname(),
        }
    }

    /// Cancel a job.
    ///
    /// Pending jobs are cancelled directly in the ledger. Running jobs are
    /// flagged and given `window` to stop on their own; after that the
    /// recorded process group is killed and the ledger is written here.
    ///
    /// Direct termination only reaches processes recorded on this host. A
    /// job running elsewhere is left flagged and reported as
    /// [`CancelOutcome::Requested`]. The cache charge is released even if a
    /// local process survives SIGKILL.
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<CancelOutcome> {
        let ledger = self.accountant.ledger();
        let Some(job) = ledger.get_job(job_id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        if job.state.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }

        if let Err(e) = self.signal.request_cancel(job_id).await {
            warn!(job_id = %job_id, error = %e, "failed to set cancellation flag");
        }
        info!(job_id = %job_id, state = %job.state, "cancellation requested");

        match job.state {
            JobState::Pending => self.cancel_pending(job_id).await,
            JobState::Running => self.cancel_running(job_id).await,
            JobState::Completed | JobState::Failed | JobState::Cancelled => {
                Ok(CancelOutcome::AlreadyTerminal)
            }
        }
    }

    async fn cancel_pending(&self, job_id: &JobId) -> Result<CancelOutcome> {
        let ledger = self.accountant.ledger();
        if !ledger
            .finish_job(
                job_id,
                JobState::Cancelled,
                Some(TERMINATED_EXIT_CODE),
                Some("cancelled before start"),
            )
            .await?
        {
            return self.settled_outcome(job_id).await;
        }

        // The scheduler may have reserved the job after it was read as
        // pending. An executor that picks up that dispatch sees a terminal
        // job and stands down.
        if self.accountant.release(job_id).await?.is_none() {
            if let Err(e) = self.signal.clear(job_id).await {
                debug!(job_id = %job_id, error = %e, "failed to clear cancellation flag");
            }
        }
        info!(job_id = %job_id, "pending job cancelled");
        Ok(CancelOutcome::Cancelled)
    }

    async fn cancel_running(&self, job_id: &JobId) -> Result<CancelOutcome> {
        let ledger = self.accountant.ledger();
        let deadline = Instant::now() + self.window;

        loop {
            if let Some(job) = ledger.get_job(job_id).await? {
                if job.state.is_terminal() {
                    return Ok(outcome_for(job.state));
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let allocation = ledger.active_allocation(job_id).await?;
        let pid = allocation.as_ref().and_then(|a| a.process_id);
        if pid.is_some() {
            let host = allocation.as_ref().and_then(|a| a.process_host.as_deref());
            if host != Some(self.hostname.as_str()) {
                warn!(
                    job_id = %job_id,
                    host = host.unwrap_or("unknown"),
                    "executor did not stop the job in time, process is not on this host"
                );
                return Ok(CancelOutcome::Requested);
            }
        }

        warn!(
            job_id = %job_id,
            window_secs = self.window.as_secs(),
            "executor did not stop the job in time, terminating directly"
        );

        let error = match pid {
            Some(pid) if self.terminator.terminate(pid, self.grace_period).await => {
                "cancelled: process group terminated"
            }
            Some(pid) => {
                warn!(job_id = %job_id, pid, "process group could not be killed");
                "cancelled: process group did not exit"
            }
            None => "cancelled: no process recorded",
        };

        if !ledger
            .finish_job(
                job_id,
                JobState::Cancelled,
                Some(TERMINATED_EXIT_CODE),
                Some(error),
            )
            .await?
        {
            return self.settled_outcome(job_id).await;
        }
        self.accountant.release(job_id).await?;
        info!(job_id = %job_id, "running job cancelled");
        Ok(CancelOutcome::Cancelled)
    }

    /// Outcome when another writer reached a terminal state first.
    async fn settled_outcome(&self, job_id: &JobId) -> Result<CancelOutcome> {
        Ok(match self.accountant.ledger().get_job(job_id).await? {
            Some(job) => outcome_for(job.state),
            None => CancelOutcome::NotFound,
        })
    }
}

const fn outcome_for(state: JobState) -> CancelOutcome {
    match state {
        JobState::Cancelled => CancelOutcome::Cancelled,
        JobState::Pending | JobState::Running | JobState::Completed | JobState::Failed => {
            CancelOutcome::AlreadyTerminal
        }
    }
}
