//! Integration tests for the reaper sweeps.

mod common;

use armada_scheduler::reaper::{EXECUTION_ORPHANED, QUEUE_LOST};
use armada_scheduler::ExecutionOutcome;
use armada_state::{AllocationStatus, JobState, Ledger};
use common::fixtures::JobBuilder;
use common::{TestCluster, QUEUE};

#[tokio::test]
async fn lost_dispatch_is_reaped_as_failed() {
    let cluster = TestCluster::new();
    cluster.add_worker("w1", 16).await;
    let job = cluster.submit(JobBuilder::new(8).build()).await;
    cluster.scheduler.tick().await.unwrap();
    let counter_before = cluster.counter().await;

    assert_eq!(cluster.queue_backend.inner().purge(QUEUE).await, 1);
    cluster.ledger.backdate(&job, chrono::Duration::minutes(11)).await;

    let report = cluster.reaper.sweep().await;
    assert_eq!(report.stale_reservations, vec![job.clone()]);
    assert!(report.orphaned.is_empty());

    let record = cluster.job(&job).await;
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.error_msg.as_deref(), Some(QUEUE_LOST));
    assert_eq!(
        cluster.allocations(&job).await[0].status,
        AllocationStatus::Released
    );
    assert_eq!(cluster.counter().await, counter_before);
}

#[tokio::test]
async fn fresh_reservations_are_left_alone() {
    let cluster = TestCluster::new();
    cluster.add_worker("w1", 16).await;
    let job = cluster.submit(JobBuilder::new(8).build()).await;
    cluster.scheduler.tick().await.unwrap();
    cluster.ledger.backdate(&job, chrono::Duration::minutes(9)).await;

    assert!(cluster.reaper.sweep().await.is_empty());
    assert_eq!(cluster.job(&job).await.state, JobState::Running);

    // The dispatch is still runnable.
    let report = cluster.run_next().await.unwrap();
    assert_eq!(report.final_state(), Some(JobState::Completed));
}

#[tokio::test]
async fn orphaned_job_is_reaped_and_discharged() {
    let cluster = TestCluster::new();
    let job = cluster.submit(JobBuilder::new(6).build()).await;
    let survivor = cluster.submit(JobBuilder::new(6).build()).await;
    for id in [&job, &survivor] {
        cluster.accountant.reserve(id, 6).await.unwrap();
        cluster.accountant.promote(id).await.unwrap();
    }
    assert_eq!(cluster.counter().await, Some(12));

    cluster.ledger.backdate(&job, chrono::Duration::hours(25)).await;
    let report = cluster.reaper.sweep().await;
    assert_eq!(report.orphaned, vec![job.clone()]);
    assert!(report.stale_reservations.is_empty());

    let record = cluster.job(&job).await;
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.error_msg.as_deref(), Some(EXECUTION_ORPHANED));
    assert_eq!(cluster.counter().await, Some(6));
    assert_eq!(cluster.job(&survivor).await.state, JobState::Running);
    assert_eq!(cluster.ledger.sum_allocated().await.unwrap(), 6);
}

#[tokio::test]
async fn late_dispatch_after_reaping_stands_down() {
    let cluster = TestCluster::new();
    cluster.add_worker("w1", 16).await;
    let job = cluster.submit(JobBuilder::new(4).build()).await;
    cluster.scheduler.tick().await.unwrap();
    cluster.ledger.backdate(&job, chrono::Duration::minutes(30)).await;

    cluster.reaper.sweep().await;
    let report = cluster.run_next().await.unwrap();
    assert!(matches!(report.outcome, ExecutionOutcome::Ignored { .. }));
    assert_eq!(cluster.job(&job).await.state, JobState::Failed);
}

#[tokio::test]
async fn sweep_is_idempotent() {
    let cluster = TestCluster::new();
    cluster.add_worker("w1", 16).await;
    let job = cluster.submit(JobBuilder::new(4).build()).await;
    cluster.scheduler.tick().await.unwrap();
    cluster.ledger.backdate(&job, chrono::Duration::hours(2)).await;

    assert_eq!(cluster.reaper.sweep().await.stale_reservations.len(), 1);
    assert!(cluster.reaper.sweep().await.is_empty());
}
