//! Armada scheduler - CPU-accounted job scheduling across a dynamic pool of
//! workers.
//!
//! The crate covers the resource-accounting and job-lifecycle core:
//!
//! - **Worker liveness**: workers hold leased records in the cache
//!   ([`WorkerRegistry`]); an expired lease is the only signal of death
//! - **Accounting**: allocations move `reserved -> allocated -> released` in
//!   the ledger, and only allocated rows are charged to the cached counter
//!   ([`ResourceAccountant`])
//! - **Scheduling**: a FIFO-by-capacity loop reserves pending jobs and
//!   publishes them to the work queue ([`Scheduler`])
//! - **Execution**: workers promote, run and clean up each job
//!   ([`JobExecutor`]), observing cancellation and time limits
//! - **Recovery**: the [`Reaper`] fails jobs whose dispatch or executor was
//!   lost, and periodic resync corrects cache drift
//!
//! # Example
//!
//! ```ignore
//! use armada_scheduler::{ArmadaConfig, SchedulerService};
//!
//! let config = ArmadaConfig::load(None)?;
//! SchedulerService::new(config).run().await?;
//! ```

pub mod accountant;
pub mod cancel;
pub mod config;
pub mod error;
pub mod executor;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod terminator;

pub use accountant::{CapacitySnapshot, ResourceAccountant, ALLOCATED_CPUS_KEY};
pub use cancel::{cancel_key, CancelOutcome, CancellationSignal, JobCanceller};
pub use config::{
    AccountingConfig, ArmadaConfig, CancelConfig, ExecutorConfig, ReaperConfig, SchedulingConfig,
    WorkerConfig,
};
pub use error::{Result, SchedulerError};
pub use executor::{ExecutionOutcome, ExecutionReport, ExecutionState, JobExecutor};
pub use queue::{JobDispatch, WorkQueue};
pub use reaper::{ReapReport, Reaper};
pub use registry::{live_workers, WorkerId, WorkerRecord, WorkerRegistry, WorkerStatus};
pub use scheduler::{Scheduler, TickReport};
pub use service::{Components, SchedulerService, WorkerService};
pub use terminator::{local_hostname, ProcessTreeTerminator};
