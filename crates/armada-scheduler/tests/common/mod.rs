//! Common test utilities for scheduler integration tests.

#![allow(dead_code)]

pub mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use armada_scheduler::{
    ArmadaConfig, CancellationSignal, ExecutionReport, JobCanceller, JobDispatch, JobExecutor,
    ProcessTreeTerminator, Reaper, ResourceAccountant, Scheduler, WorkQueue, WorkerRegistry,
    ALLOCATED_CPUS_KEY,
};
use armada_state::{
    Allocation, CacheBackend, JobId, JobRecord, JobSpec, Ledger, MemoryLedger,
};

use fixtures::{FaultyCache, FaultyQueue};

pub const QUEUE: &str = "dispatch";

/// Complete in-memory cluster with every component wired together.
pub struct TestCluster {
    pub config: ArmadaConfig,
    pub cache: Arc<FaultyCache>,
    pub ledger: Arc<MemoryLedger>,
    pub queue_backend: Arc<FaultyQueue>,
    pub queue: WorkQueue,
    pub accountant: ResourceAccountant,
    pub signal: CancellationSignal,
    pub scheduler: Scheduler,
    pub executor: JobExecutor,
    pub reaper: Reaper,
    pub canceller: JobCanceller,
}

impl TestCluster {
    /// Creates a cluster with fast poll intervals.
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: ArmadaConfig) -> Self {
        let cache = Arc::new(FaultyCache::new());
        let ledger = Arc::new(MemoryLedger::new());
        let queue_backend = Arc::new(FaultyQueue::new());

        let accountant = ResourceAccountant::new(cache.clone(), ledger.clone());
        let signal = CancellationSignal::new(cache.clone(), config.cancel.signal_ttl);
        let queue = WorkQueue::new(queue_backend.clone(), QUEUE);
        let terminator = ProcessTreeTerminator::new(Duration::from_millis(20));

        let scheduler = Scheduler::new(accountant.clone(), queue.clone(), config.scheduler.batch_size);
        let executor = JobExecutor::new(
            accountant.clone(),
            signal.clone(),
            terminator.clone(),
            &config.executor,
        );
        let reaper = Reaper::new(accountant.clone(), &config.reaper);
        let canceller = JobCanceller::new(
            accountant.clone(),
            signal.clone(),
            terminator,
            &config.cancel,
            config.executor.grace_period,
        );

        Self {
            config,
            cache,
            ledger,
            queue_backend,
            queue,
            accountant,
            signal,
            scheduler,
            executor,
            reaper,
            canceller,
        }
    }

    /// Registers a worker and returns its registry handle.
    pub async fn add_worker(&self, id: &str, cpus: u32) -> WorkerRegistry {
        let registry = WorkerRegistry::new(self.cache.clone(), self.config.worker.lease);
        registry.register(id, cpus, "test-host").await.unwrap();
        registry
    }

    /// Submits a job and returns its ID.
    pub async fn submit(&self, spec: JobSpec) -> JobId {
        self.ledger.insert_job(spec).await.unwrap().id
    }

    pub async fn job(&self, id: &JobId) -> JobRecord {
        self.ledger.get_job(id).await.unwrap().unwrap()
    }

    pub async fn allocations(&self, id: &JobId) -> Vec<Allocation> {
        self.ledger.allocations_for(id).await
    }

    /// The cached allocated-CPU counter as stored, bypassing fault injection.
    pub async fn counter(&self) -> Option<i64> {
        self.cache
            .inner()
            .get(ALLOCATED_CPUS_KEY)
            .await
            .unwrap()
            .map(|bytes| String::from_utf8(bytes).unwrap().parse().unwrap())
    }

    /// Sets the cached counter directly.
    pub async fn set_counter(&self, value: i64) {
        self.cache
            .inner()
            .put(ALLOCATED_CPUS_KEY, value.to_string().as_bytes(), None)
            .await
            .unwrap();
    }

    /// Takes the next dispatch off the queue.
    pub async fn take(&self) -> Option<JobDispatch> {
        self.queue.take().await.unwrap()
    }

    /// Takes the next dispatch and runs it to completion.
    pub async fn run_next(&self) -> Option<ExecutionReport> {
        let dispatch = self.take().await?;
        Some(self.executor.run_job(dispatch).await.unwrap())
    }

    /// Waits until `id`'s live allocation is ALLOCATED with a recorded pid.
    pub async fn wait_until_running(&self, id: &JobId) -> u32 {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(pid) = self
                    .ledger
                    .active_allocation(id)
                    .await
                    .unwrap()
                    .and_then(|a| a.process_id)
                {
                    return pid;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not start in time")
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration with intervals short enough for tests.
pub fn fast_config() -> ArmadaConfig {
    let mut config = ArmadaConfig::default();
    config.executor.poll_interval = Duration::from_millis(20);
    config.executor.grace_period = Duration::from_millis(500);
    config.cancel.window = Duration::from_secs(2);
    config.cancel.poll_interval = Duration::from_millis(20);
    config.worker.heartbeat_interval = Duration::from_millis(100);
    config.worker.idle_poll = Duration::from_millis(20);
    config.scheduler.tick_interval = Duration::from_millis(50);
    config
}
