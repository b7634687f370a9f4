//! Per-job execution.
//!
//! A job moves through
//! `Initialized -> ResourcesConfirmed -> Running -> {Completed, Failed,
//! Cancelled} -> CleanedUp`, skipping forward when it is cancelled early.
//! Cleanup runs on every path out of the body, including panics: the
//! allocation is released, the cancellation flag cleared and the terminal
//! state written to the ledger.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use armada_state::{AllocationStatus, JobId, JobState};
use futures::FutureExt;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::accountant::ResourceAccountant;
use crate::cancel::CancellationSignal;
use crate::config::ExecutorConfig;
use crate::error::{Result, SchedulerError};
use crate::queue::JobDispatch;
use crate::terminator::{local_hostname, ProcessTreeTerminator, TERMINATED_EXIT_CODE};

/// Steps of a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Initialized,
    ResourcesConfirmed,
    Running,
    Completed,
    Failed,
    Cancelled,
    CleanedUp,
}

impl ExecutionState {
    const fn for_job_state(state: JobState) -> Self {
        match state {
            JobState::Completed => Self::Completed,
            JobState::Cancelled => Self::Cancelled,
            JobState::Failed | JobState::Pending | JobState::Running => Self::Failed,
        }
    }
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The job ran to a terminal state and was cleaned up.
    Finished {
        state: JobState,
        exit_code: Option<i32>,
        error: Option<String>,
        /// False when another writer had already recorded a terminal state.
        recorded: bool,
    },
    /// The dispatch was stale or duplicate and nothing was touched.
    Ignored { reason: String },
    /// The job had become terminal before it started. Its reservation was
    /// released.
    Superseded { state: JobState },
}

/// The path an execution took and how it ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub job_id: JobId,
    pub states: Vec<ExecutionState>,
    pub outcome: ExecutionOutcome,
}

impl ExecutionReport {
    /// Terminal job state, if the job was run.
    pub const fn final_state(&self) -> Option<JobState> {
        match &self.outcome {
            ExecutionOutcome::Finished { state, .. } => Some(*state),
            ExecutionOutcome::Ignored { .. } | ExecutionOutcome::Superseded { .. } => None,
        }
    }
}

/// Terminal state chosen by the body, before cleanup.
#[derive(Debug)]
struct Termination {
    state: JobState,
    exit_code: Option<i32>,
    error: Option<String>,
}

impl Termination {
    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => Self {
                state: JobState::Completed,
                exit_code: Some(0),
                error: None,
            },
            Some(code) => Self {
                state: JobState::Failed,
                exit_code: Some(code),
                error: Some(format!("exited with status {code}")),
            },
            None => {
                use std::os::unix::process::ExitStatusExt;
                let signal = status.signal().unwrap_or_default();
                Self {
                    state: JobState::Failed,
                    exit_code: Some(-signal),
                    error: Some(format!("terminated by signal {signal}")),
                }
            }
        }
    }

    fn cancelled(exit_code: Option<i32>, error: impl Into<String>) -> Self {
        Self {
            state: JobState::Cancelled,
            exit_code,
            error: Some(error.into()),
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            exit_code: None,
            error: Some(error.into()),
        }
    }
}

/// Mutable per-execution bookkeeping shared between body and cleanup.
#[derive(Debug)]
struct Execution {
    job_id: JobId,
    states: Vec<ExecutionState>,
    pid: Option<u32>,
}

impl Execution {
    fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            states: vec![ExecutionState::Initialized],
            pid: None,
        }
    }

    fn enter(&mut self, state: ExecutionState) {
        debug!(job_id = %self.job_id, state = ?state, "execution state");
        self.states.push(state);
    }
}

/// Runs dispatched jobs as child processes.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    accountant: ResourceAccountant,
    signal: CancellationSignal,
    terminator: ProcessTreeTerminator,
    poll_interval: Duration,
    grace_period: Duration,
    shell: PathBuf,
    working_dir: Option<PathBuf>,
    hostname: String,
}

impl JobExecutor {
    pub fn new(
        accountant: ResourceAccountant,
        signal: CancellationSignal,
        terminator: ProcessTreeTerminator,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            accountant,
            signal,
            terminator,
            poll_interval: config.poll_interval,
            grace_period: config.grace_period,
            shell: config.shell.clone(),
            working_dir: config.working_dir.clone(),
            hostname: local_hostname(),
        }
    }

    /// Drive one dispatched job to a terminal state.
    ///
    /// Errors are returned only when the dispatch could not be validated.
    /// Once the job is accepted, every failure ends in cleanup and a report.
    pub async fn run_job(&self, dispatch: JobDispatch) -> Result<ExecutionReport> {
        let job_id = dispatch.job_id.clone();
        let mut execution = Execution::new(job_id.clone());

        if let Some(outcome) = self.screen(&dispatch).await? {
            return Ok(ExecutionReport {
                job_id,
                states: execution.states,
                outcome,
            });
        }

        info!(job_id = %job_id, cpus = dispatch.cpus, "job accepted");

        let body = AssertUnwindSafe(self.execute(&dispatch, &mut execution))
            .catch_unwind()
            .await;

        let termination = match body {
            Ok(Ok(termination)) => termination,
            Ok(Err(e)) => {
                error!(job_id = %job_id, error = %e, "job execution failed");
                Termination::failed(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(job_id = %job_id, panic = %message, "job execution panicked");
                if let Some(pid) = execution.pid {
                    self.terminator.terminate(pid, self.grace_period).await;
                }
                Termination::failed(format!("executor panicked: {message}"))
            }
        };

        let outcome = self.cleanup(&mut execution, termination).await;
        Ok(ExecutionReport {
            job_id,
            states: execution.states,
            outcome,
        })
    }

    /// Decide whether a dispatch should run at all.
    async fn screen(&self, dispatch: &JobDispatch) -> Result<Option<ExecutionOutcome>> {
        let job_id = &dispatch.job_id;
        let ledger = self.accountant.ledger();

        let Some(job) = ledger.get_job(job_id).await? else {
            warn!(job_id = %job_id, "dispatch for unknown job");
            return Ok(Some(ExecutionOutcome::Ignored {
                reason: "job not found".to_owned(),
            }));
        };

        let allocation = ledger.active_allocation(job_id).await?;
        match allocation.as_ref().map(|a| a.status) {
            Some(AllocationStatus::Reserved) => {}
            Some(status @ (AllocationStatus::Allocated | AllocationStatus::Released)) => {
                warn!(job_id = %job_id, status = %status, "duplicate dispatch, ignoring");
                return Ok(Some(ExecutionOutcome::Ignored {
                    reason: format!("allocation is {status}"),
                }));
            }
            None => {
                warn!(job_id = %job_id, "stale dispatch without a live reservation, ignoring");
                return Ok(Some(ExecutionOutcome::Ignored {
                    reason: "no live allocation".to_owned(),
                }));
            }
        }

        match job.state {
            JobState::Running => Ok(None),
            JobState::Completed | JobState::Failed | JobState::Cancelled => {
                info!(job_id = %job_id, state = %job.state, "job ended before start, releasing reservation");
                self.accountant.release(job_id).await?;
                if let Err(e) = self.signal.clear(job_id).await {
                    debug!(job_id = %job_id, error = %e, "failed to clear cancellation flag");
                }
                Ok(Some(ExecutionOutcome::Superseded { state: job.state }))
            }
            JobState::Pending => {
                warn!(
                    anomaly = "unexpected_status",
                    job_id = %job_id,
                    "pending job holds a reservation, ignoring dispatch"
                );
                Ok(Some(ExecutionOutcome::Ignored {
                    reason: "job is pending".to_owned(),
                }))
            }
        }
    }

    async fn execute(
        &self,
        dispatch: &JobDispatch,
        execution: &mut Execution,
    ) -> Result<Termination> {
        let job_id = &dispatch.job_id;

        if self.cancel_requested(job_id).await {
            info!(job_id = %job_id, "cancelled before start");
            return Ok(Termination::cancelled(
                Some(TERMINATED_EXIT_CODE),
                "cancelled before start",
            ));
        }

        self.accountant.promote(job_id).await?;
        execution.enter(ExecutionState::ResourcesConfirmed);

        if self.cancel_requested(job_id).await {
            info!(job_id = %job_id, "cancelled during promotion");
            return Ok(Termination::cancelled(
                Some(TERMINATED_EXIT_CODE),
                "cancelled before start",
            ));
        }

        let mut child = match self.spawn(dispatch) {
            Ok(child) => child,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to spawn job");
                return Ok(Termination::failed(e.to_string()));
            }
        };

        execution.pid = child.id();
        if let Some(pid) = execution.pid {
            let ledger = self.accountant.ledger();
            if let Err(e) = ledger.attach_process(job_id, pid, &self.hostname).await {
                warn!(job_id = %job_id, pid, error = %e, "failed to record process id");
            }
        }
        execution.enter(ExecutionState::Running);
        info!(job_id = %job_id, pid = ?execution.pid, "job running");

        self.supervise(dispatch, &mut child).await
    }

    /// Wait for exit while polling for cancellation and the time limit.
    async fn supervise(&self, dispatch: &JobDispatch, child: &mut Child) -> Result<Termination> {
        let job_id = &dispatch.job_id;
        let deadline = dispatch.time_limit.map(|limit| Instant::now() + limit);

        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status?;
                    debug!(job_id = %job_id, status = %status, "job exited");
                    return Ok(Termination::from_status(status));
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }

            if self.cancel_requested(job_id).await {
                info!(job_id = %job_id, "cancellation observed, terminating");
                let stopped = self.terminator.terminate_child(child, self.grace_period).await;
                return Ok(Termination::cancelled(
                    Some(TERMINATED_EXIT_CODE),
                    if stopped {
                        "cancelled"
                    } else {
                        "cancelled; process group did not exit"
                    },
                ));
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                info!(job_id = %job_id, "time limit exceeded, terminating");
                self.terminator.terminate_child(child, self.grace_period).await;
                return Ok(Termination::cancelled(
                    Some(TERMINATED_EXIT_CODE),
                    "time limit exceeded",
                ));
            }
        }
    }

    fn spawn(&self, dispatch: &JobDispatch) -> Result<Child> {
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&dispatch.script)
            .envs(&dispatch.environment)
            .env("ARMADA_JOB_ID", dispatch.job_id.as_str())
            .env("ARMADA_CPUS", dispatch.cpus.to_string())
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        command.spawn().map_err(|source| SchedulerError::Spawn {
            job_id: dispatch.job_id.clone(),
            source,
        })
    }

    async fn cancel_requested(&self, job_id: &JobId) -> bool {
        match self.signal.is_cancelled(job_id).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "cancellation check failed");
                false
            }
        }
    }

    async fn cleanup(&self, execution: &mut Execution, termination: Termination) -> ExecutionOutcome {
        let job_id = execution.job_id.clone();
        execution.enter(ExecutionState::for_job_state(termination.state));

        if let Err(e) = self.accountant.release(&job_id).await {
            error!(job_id = %job_id, error = %e, "failed to release allocation");
        }
        if let Err(e) = self.signal.clear(&job_id).await {
            warn!(job_id = %job_id, error = %e, "failed to clear cancellation flag");
        }

        let recorded = match self
            .accountant
            .ledger()
            .finish_job(
                &job_id,
                termination.state,
                termination.exit_code,
                termination.error.as_deref(),
            )
            .await
        {
            Ok(recorded) => recorded,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed to record final job state");
                false
            }
        };

        execution.enter(ExecutionState::CleanedUp);
        info!(
            job_id = %job_id,
            state = %termination.state,
            exit_code = ?termination.exit_code,
            recorded,
            "job finished"
        );

        ExecutionOutcome::Finished {
            state: termination.state,
            exit_code: termination.exit_code,
            error: termination.error,
            recorded,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
