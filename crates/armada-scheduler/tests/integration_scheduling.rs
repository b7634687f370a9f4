//! Integration tests for the scheduling loop.

mod common;

use armada_state::{AllocationStatus, JobState, Ledger};
use common::fixtures::JobBuilder;
use common::TestCluster;
use rstest::rstest;

#[tokio::test]
async fn no_workers_schedules_nothing() {
    let cluster = TestCluster::new();
    let job = cluster.submit(JobBuilder::new(1).build()).await;

    assert_eq!(cluster.accountant.total_capacity().await.unwrap(), 0);
    let report = cluster.scheduler.tick().await.unwrap();

    assert!(report.skipped());
    assert!(report.reserved.is_empty());
    assert_eq!(cluster.job(&job).await.state, JobState::Pending);
    assert!(cluster.take().await.is_none());
}

#[tokio::test]
async fn single_worker_reserves_then_promotes() {
    let cluster = TestCluster::new();
    cluster.add_worker("w1", 96).await;
    let job = cluster.submit(JobBuilder::new(40).build()).await;

    let report = cluster.scheduler.tick().await.unwrap();
    assert_eq!(report.reserved, vec![job.clone()]);
    assert_eq!(cluster.job(&job).await.state, JobState::Running);

    // Reservation alone leaves the counter untouched.
    let snapshot = cluster.accountant.snapshot().await.unwrap();
    assert_eq!(snapshot.available, 96);

    cluster.accountant.promote(&job).await.unwrap();
    let snapshot = cluster.accountant.snapshot().await.unwrap();
    assert_eq!(snapshot.total, 96);
    assert_eq!(snapshot.allocated, 40);
    assert_eq!(snapshot.available, 56);
}

#[tokio::test]
async fn second_large_job_waits_for_next_tick() {
    let cluster = TestCluster::new();
    cluster.add_worker("w1", 96).await;
    let first = cluster.submit(JobBuilder::new(60).build()).await;
    let second = cluster.submit(JobBuilder::new(60).build()).await;

    let report = cluster.scheduler.tick().await.unwrap();
    assert_eq!(report.reserved, vec![first.clone()]);
    assert_eq!(report.deferred, vec![second.clone()]);
    assert_eq!(cluster.job(&second).await.state, JobState::Pending);

    // Still deferred while the first job holds its CPUs.
    cluster.accountant.promote(&first).await.unwrap();
    let report = cluster.scheduler.tick().await.unwrap();
    assert_eq!(report.deferred, vec![second.clone()]);

    cluster.accountant.release(&first).await.unwrap();
    let report = cluster.scheduler.tick().await.unwrap();
    assert_eq!(report.reserved, vec![second]);
}

#[rstest]
#[case::exact_fit(&[32, 32, 32], 96, 3)]
#[case::one_too_many(&[32, 32, 33], 96, 2)]
#[case::small_behind_large(&[90, 20, 6], 96, 2)]
#[case::fills_with_small_jobs(&[1; 10], 8, 8)]
#[tokio::test]
async fn packs_jobs_fifo_by_capacity(
    #[case] jobs: &[u32],
    #[case] capacity: u32,
    #[case] expected: usize,
) {
    let cluster = TestCluster::new();
    cluster.add_worker("w1", capacity).await;
    for &cpus in jobs {
        cluster.submit(JobBuilder::new(cpus).build()).await;
    }

    let report = cluster.scheduler.tick().await.unwrap();
    assert_eq!(report.reserved.len(), expected);
    assert_eq!(report.deferred.len(), jobs.len() - expected);
    assert_eq!(cluster.queue.depth().await.unwrap(), expected);
}

#[tokio::test]
async fn capacity_spans_workers_and_ignores_draining() {
    let cluster = TestCluster::new();
    cluster.add_worker("w1", 32).await;
    cluster.add_worker("w2", 32).await;
    let draining = cluster.add_worker("w3", 32).await;
    draining.mark_draining().await.unwrap();

    let job = cluster.submit(JobBuilder::new(64).build()).await;
    let too_big = cluster.submit(JobBuilder::new(65).build()).await;

    let report = cluster.scheduler.tick().await.unwrap();
    assert_eq!(report.capacity.unwrap().total, 64);
    assert_eq!(report.reserved, vec![job]);
    assert_eq!(report.rejected, vec![too_big.clone()]);
    assert_eq!(cluster.job(&too_big).await.state, JobState::Failed);
}

#[tokio::test]
async fn negative_available_is_clamped_and_resynced() {
    let cluster = TestCluster::new();
    cluster.add_worker("w1", 16).await;
    cluster.set_counter(40).await;
    let job = cluster.submit(JobBuilder::new(4).build()).await;

    let report = cluster.scheduler.tick().await.unwrap();
    assert!(report.drift);
    assert_eq!(report.capacity.unwrap().available, 0);
    assert_eq!(report.deferred, vec![job.clone()]);
    assert_eq!(cluster.counter().await, Some(0));

    let report = cluster.scheduler.tick().await.unwrap();
    assert!(!report.drift);
    assert_eq!(report.reserved, vec![job]);
}

#[tokio::test]
async fn failed_publish_rolls_back_reservation() {
    let cluster = TestCluster::new();
    cluster.add_worker("w1", 8).await;
    let job = cluster.submit(JobBuilder::new(4).build()).await;

    cluster.queue_backend.set_failing(true);
    let report = cluster.scheduler.tick().await.unwrap();
    assert_eq!(report.requeued, vec![job.clone()]);
    assert!(report.reserved.is_empty());

    let record = cluster.job(&job).await;
    assert_eq!(record.state, JobState::Pending);
    assert!(record.start_time.is_none());
    let allocations = cluster.allocations(&job).await;
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0].status, AllocationStatus::Released);
    assert_eq!(cluster.counter().await, Some(0));

    cluster.queue_backend.set_failing(false);
    let report = cluster.scheduler.tick().await.unwrap();
    assert_eq!(report.reserved, vec![job.clone()]);
    assert_eq!(cluster.allocations(&job).await.len(), 2);
}

#[tokio::test]
async fn cache_outage_skips_tick_without_side_effects() {
    let cluster = TestCluster::new();
    cluster.add_worker("w1", 8).await;
    let job = cluster.submit(JobBuilder::new(4).build()).await;

    cluster.cache.set_failing(true);
    assert!(cluster.scheduler.tick().await.is_err());
    assert_eq!(cluster.job(&job).await.state, JobState::Pending);

    cluster.cache.set_failing(false);
    let report = cluster.scheduler.tick().await.unwrap();
    assert_eq!(report.reserved, vec![job]);
}

#[tokio::test]
async fn cancelled_jobs_are_not_scheduled() {
    let cluster = TestCluster::new();
    cluster.add_worker("w1", 8).await;
    let job = cluster.submit(JobBuilder::new(4).build()).await;
    cluster
        .ledger
        .finish_job(&job, JobState::Cancelled, None, None)
        .await
        .unwrap();

    let report = cluster.scheduler.tick().await.unwrap();
    assert!(report.reserved.is_empty());
    assert!(cluster.allocations(&job).await.is_empty());
}
