//! Service lifecycle management.
//!
//! Wires backends and background tasks for the `scheduler` and `worker`
//! roles and runs them until a shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;

use armada_state::{CacheBackend, JobId, MemoryCache, StateProvider};
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::accountant::ResourceAccountant;
use crate::cancel::{CancelOutcome, CancellationSignal, JobCanceller};
use crate::config::ArmadaConfig;
use crate::error::Result;
use crate::executor::{ExecutionOutcome, JobExecutor};
use crate::queue::WorkQueue;
use crate::reaper::Reaper;
use crate::registry::WorkerRegistry;
use crate::scheduler::Scheduler;
use crate::terminator::{local_hostname, ProcessTreeTerminator};

/// Backends shared by every role.
#[derive(Debug, Clone)]
pub struct Components {
    pub accountant: ResourceAccountant,
    pub signal: CancellationSignal,
    pub queue: WorkQueue,
}

impl Components {
    /// Build components over an already constructed provider.
    pub fn from_provider(provider: &StateProvider, config: &ArmadaConfig) -> Result<Self> {
        let cache = provider.cache()?;
        let accountant = ResourceAccountant::new(cache.clone(), provider.ledger()?);
        let signal = CancellationSignal::new(cache, config.cancel.signal_ttl);
        let queue = WorkQueue::new(provider.queue()?, config.scheduler.queue.clone());
        Ok(Self {
            accountant,
            signal,
            queue,
        })
    }

    /// Connect to the configured backends. Any unreachable backend is fatal.
    ///
    /// Workers and the cancel command share liveness, the allocated counter
    /// and cancellation flags through the cache, so they cannot run on a
    /// private one.
    pub async fn connect(config: &ArmadaConfig) -> Result<Self> {
        let cache = StateProvider::create_cache(&config.state.cache).await?;
        info!(backend = config.state.cache.backend_name(), "cache connected");
        Self::connect_with_cache(cache, config).await
    }

    /// Connect, replacing an unreachable cache with an in-memory one.
    ///
    /// For the scheduler role only. The counter is rebuilt from the ledger,
    /// and with no worker records visible the scheduler dispatches nothing
    /// until the shared cache is back.
    pub async fn connect_with_cache_fallback(config: &ArmadaConfig) -> Result<Self> {
        let cache: Arc<dyn CacheBackend> =
            match StateProvider::create_cache(&config.state.cache).await {
                Ok(cache) => {
                    info!(backend = config.state.cache.backend_name(), "cache connected");
                    cache
                }
                Err(e) => {
                    error!(error = %e, "failed to connect to cache, using in-memory cache");
                    Arc::new(MemoryCache::new())
                }
            };
        Self::connect_with_cache(cache, config).await
    }

    async fn connect_with_cache(cache: Arc<dyn CacheBackend>, config: &ArmadaConfig) -> Result<Self> {
        let ledger = StateProvider::create_ledger(&config.state.ledger).await?;
        let queue = StateProvider::create_queue(&config.state.queue).await?;
        info!("ledger and queue connected");

        let provider = StateProvider::new()
            .with_cache(cache)
            .with_ledger(ledger)
            .with_queue(queue);
        Self::from_provider(&provider, config)
    }
}

/// The central role: scheduling loop, cache resync and reaper.
pub struct SchedulerService {
    config: ArmadaConfig,
    cancel: CancellationToken,
}

impl SchedulerService {
    #[must_use]
    pub fn new(config: ArmadaConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn run(&self) -> Result<()> {
        let components = Components::connect_with_cache_fallback(&self.config).await?;
        self.run_with(components).await
    }

    /// Run the background loops over the given components until shutdown.
    pub async fn run_with(&self, components: Components) -> Result<()> {
        let scheduler = Scheduler::new(
            components.accountant.clone(),
            components.queue.clone(),
            self.config.scheduler.batch_size,
        );
        let reaper = Reaper::new(components.accountant.clone(), &self.config.reaper);
        let accountant = components.accountant;

        if let Err(e) = accountant.resync_cache().await {
            warn!(error = %e, "initial cache resync failed");
        }

        let mut tasks = JoinSet::new();
        {
            let cancel = self.cancel.clone();
            let interval = self.config.scheduler.tick_interval;
            tasks.spawn(async move { scheduler.run(interval, cancel).await });
        }
        {
            let cancel = self.cancel.clone();
            let interval = self.config.accounting.resync_interval;
            tasks.spawn(async move { accountant.run_resync(interval, cancel).await });
        }
        {
            let cancel = self.cancel.clone();
            let interval = self.config.reaper.sweep_interval;
            tasks.spawn(async move { reaper.run(interval, cancel).await });
        }

        shutdown_signal(self.cancel.clone()).await;
        self.cancel.cancel();
        join_all(&mut tasks).await;

        info!("scheduler service shutdown complete");
        Ok(())
    }
}

/// A compute worker: registration, heartbeat and execution slots.
pub struct WorkerService {
    config: ArmadaConfig,
    cancel: CancellationToken,
}

impl WorkerService {
    #[must_use]
    pub fn new(config: ArmadaConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn run(&self) -> Result<()> {
        let components = Components::connect(&self.config).await?;
        self.run_with(components).await
    }

    /// Register, execute dispatches until shutdown, then drain.
    pub async fn run_with(&self, components: Components) -> Result<()> {
        let worker = &self.config.worker;
        let worker_id = worker
            .id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", ulid::Ulid::new().to_string().to_lowercase()));
        let hostname = worker.hostname.clone().unwrap_or_else(local_hostname);

        let registry = Arc::new(WorkerRegistry::new(
            components.accountant.cache().clone(),
            worker.lease,
        ));
        registry.register(&worker_id, worker.cpus, hostname).await?;

        let executor = JobExecutor::new(
            components.accountant.clone(),
            components.signal.clone(),
            ProcessTreeTerminator::default(),
            &self.config.executor,
        );

        // Separate tokens so slots stop taking work before the heartbeat stops.
        let intake = self.cancel.child_token();
        let heartbeat = CancellationToken::new();

        let heartbeat_task = {
            let registry = Arc::clone(&registry);
            let interval = worker.heartbeat_interval;
            let cancel = heartbeat.clone();
            tokio::spawn(async move { registry.run_heartbeat(interval, cancel).await })
        };

        let mut slots = JoinSet::new();
        for slot in 0..worker.slots.max(1) {
            let executor = executor.clone();
            let queue = components.queue.clone();
            let cancel = intake.clone();
            let idle = worker.idle_poll;
            slots.spawn(async move { run_slot(slot, &executor, &queue, idle, cancel).await });
        }
        info!(worker_id = %worker_id, slots = worker.slots.max(1), "worker started");

        shutdown_signal(self.cancel.clone()).await;
        intake.cancel();

        if let Err(e) = registry.mark_draining().await {
            warn!(error = %e, "failed to mark worker draining");
        }
        info!(worker_id = %worker_id, "waiting for in-flight jobs");
        join_all(&mut slots).await;

        heartbeat.cancel();
        if let Err(e) = heartbeat_task.await {
            warn!(error = %e, "heartbeat task ended abnormally");
        }
        if let Err(e) = registry.deregister().await {
            warn!(error = %e, "failed to deregister worker");
        }

        info!(worker_id = %worker_id, "worker shutdown complete");
        Ok(())
    }
}

/// One execution slot: take a dispatch, run it, repeat.
async fn run_slot(
    slot: usize,
    executor: &JobExecutor,
    queue: &WorkQueue,
    idle: Duration,
    cancel: CancellationToken,
) {
    info!(slot, "execution slot started");

    while !cancel.is_cancelled() {
        let dispatch = match queue.take().await {
            Ok(Some(dispatch)) => dispatch,
            Ok(None) => {
                sleep_or_cancel(idle, &cancel).await;
                continue;
            }
            Err(e) => {
                warn!(slot, error = %e, "failed to take dispatch");
                sleep_or_cancel(idle, &cancel).await;
                continue;
            }
        };

        let job_id = dispatch.job_id.clone();
        match executor.run_job(dispatch).await {
            Ok(report) => match report.outcome {
                ExecutionOutcome::Finished { state, .. } => {
                    info!(slot, job_id = %job_id, state = %state, "slot finished job");
                }
                ExecutionOutcome::Ignored { reason } => {
                    info!(slot, job_id = %job_id, reason = %reason, "slot ignored dispatch");
                }
                ExecutionOutcome::Superseded { state } => {
                    info!(slot, job_id = %job_id, state = %state, "slot dropped ended job");
                }
            },
            Err(e) => warn!(slot, job_id = %job_id, error = %e, "dispatch could not be checked"),
        }
    }

    info!(slot, "execution slot stopped");
}

/// Run the cancel operation once.
pub async fn cancel_job(config: &ArmadaConfig, job_id: &JobId) -> Result<CancelOutcome> {
    let components = Components::connect(config).await?;
    let canceller = JobCanceller::new(
        components.accountant,
        components.signal,
        ProcessTreeTerminator::default(),
        &config.cancel,
        config.executor.grace_period,
    );
    canceller.cancel_job(job_id).await
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) {
    tokio::select! {
        () = cancel.cancelled() => {}
        () = tokio::time::sleep(duration) => {}
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "background task ended abnormally");
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}
