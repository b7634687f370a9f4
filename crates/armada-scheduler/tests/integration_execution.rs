//! Integration tests for the job executor.

mod common;

use std::time::Duration;

use armada_scheduler::{ExecutionOutcome, ExecutionState, JobDispatch};
use armada_state::{AllocationStatus, JobSpec, JobState, Ledger};
use common::fixtures::{JobBuilder, SLEEP_LONG};
use common::{fast_config, TestCluster};
use rstest::rstest;

/// Submits `spec`, schedules it onto a fresh worker and takes its dispatch.
async fn dispatched(cluster: &TestCluster, spec: JobSpec) -> JobDispatch {
    cluster.add_worker("w1", 64).await;
    let job = cluster.submit(spec).await;
    let report = cluster.scheduler.tick().await.unwrap();
    assert_eq!(report.reserved, vec![job]);
    cluster.take().await.unwrap()
}

#[tokio::test]
async fn successful_job_completes_and_releases() {
    let cluster = TestCluster::new();
    let dispatch = dispatched(&cluster, JobBuilder::new(4).script("exit 0").build()).await;
    let job = dispatch.job_id.clone();

    let report = cluster.executor.run_job(dispatch).await.unwrap();
    assert_eq!(
        report.states,
        vec![
            ExecutionState::Initialized,
            ExecutionState::ResourcesConfirmed,
            ExecutionState::Running,
            ExecutionState::Completed,
            ExecutionState::CleanedUp,
        ]
    );
    assert_eq!(report.final_state(), Some(JobState::Completed));

    let record = cluster.job(&job).await;
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.exit_code, Some(0));
    assert!(record.end_time.is_some());

    let allocations = cluster.allocations(&job).await;
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0].status, AllocationStatus::Released);
    assert!(allocations[0].allocated_time.is_some());
    assert!(allocations[0].process_id.is_some());
    assert_eq!(cluster.counter().await, Some(0));
}

#[rstest]
#[case::plain_exit("exit 3", 3)]
#[case::large_exit("exit 127", 127)]
#[case::killed_by_signal("kill -9 $$", -9)]
#[tokio::test]
async fn failing_job_records_exit_code(#[case] script: &str, #[case] expected: i32) {
    let cluster = TestCluster::new();
    let dispatch = dispatched(&cluster, JobBuilder::new(1).script(script).build()).await;
    let job = dispatch.job_id.clone();

    let report = cluster.executor.run_job(dispatch).await.unwrap();
    assert_eq!(report.final_state(), Some(JobState::Failed));

    let record = cluster.job(&job).await;
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.exit_code, Some(expected));
    assert!(record.error_msg.is_some());
    assert_eq!(cluster.counter().await, Some(0));
}

#[tokio::test]
async fn cancel_flag_before_start_skips_the_process() {
    let cluster = TestCluster::new();
    let dispatch = dispatched(&cluster, JobBuilder::new(2).script(SLEEP_LONG).build()).await;
    let job = dispatch.job_id.clone();
    cluster.signal.request_cancel(&job).await.unwrap();

    let report = cluster.executor.run_job(dispatch).await.unwrap();
    assert_eq!(
        report.states,
        vec![
            ExecutionState::Initialized,
            ExecutionState::Cancelled,
            ExecutionState::CleanedUp,
        ]
    );

    let record = cluster.job(&job).await;
    assert_eq!(record.state, JobState::Cancelled);
    assert_eq!(record.exit_code, Some(-15));
    assert_eq!(record.error_msg.as_deref(), Some("cancelled before start"));

    // Never promoted, so never charged.
    let allocations = cluster.allocations(&job).await;
    assert!(allocations[0].allocated_time.is_none());
    assert_eq!(allocations[0].status, AllocationStatus::Released);
    assert!(!cluster.signal.is_cancelled(&job).await.unwrap());
    assert_eq!(cluster.counter().await, Some(0));
}

#[tokio::test]
async fn cancel_during_promotion_skips_the_process() {
    let cluster = TestCluster::new();
    cluster.set_counter(5).await;
    let dispatch = dispatched(&cluster, JobBuilder::new(3).script(SLEEP_LONG).build()).await;
    let job = dispatch.job_id.clone();
    cluster.cache.cancel_on_charge(&job);

    let report = cluster.executor.run_job(dispatch).await.unwrap();
    assert_eq!(
        report.states,
        vec![
            ExecutionState::Initialized,
            ExecutionState::ResourcesConfirmed,
            ExecutionState::Cancelled,
            ExecutionState::CleanedUp,
        ]
    );

    let record = cluster.job(&job).await;
    assert_eq!(record.state, JobState::Cancelled);
    assert_eq!(record.exit_code, Some(-15));
    assert_eq!(record.error_msg.as_deref(), Some("cancelled before start"));

    let allocations = cluster.allocations(&job).await;
    assert!(allocations[0].allocated_time.is_some());
    assert!(allocations[0].process_id.is_none());
    assert_eq!(allocations[0].status, AllocationStatus::Released);
    assert!(!cluster.signal.is_cancelled(&job).await.unwrap());
    assert_eq!(cluster.counter().await, Some(5));
}

#[tokio::test]
async fn time_limit_terminates_the_job() {
    let cluster = TestCluster::new();
    let spec = JobBuilder::new(2)
        .script(SLEEP_LONG)
        .time_limit(Duration::from_millis(200))
        .build();
    let dispatch = dispatched(&cluster, spec).await;
    let job = dispatch.job_id.clone();

    let report = tokio::time::timeout(Duration::from_secs(10), cluster.executor.run_job(dispatch))
        .await
        .expect("time limit was not enforced")
        .unwrap();
    assert_eq!(report.final_state(), Some(JobState::Cancelled));

    let record = cluster.job(&job).await;
    assert_eq!(record.state, JobState::Cancelled);
    assert_eq!(record.exit_code, Some(-15));
    assert_eq!(record.error_msg.as_deref(), Some("time limit exceeded"));
    assert_eq!(cluster.counter().await, Some(0));
}

#[tokio::test]
async fn spawn_failure_fails_the_job() {
    let mut config = fast_config();
    config.executor.shell = "/nonexistent/armada-shell".into();
    let cluster = TestCluster::with_config(config);
    let dispatch = dispatched(&cluster, JobBuilder::new(3).build()).await;
    let job = dispatch.job_id.clone();

    let report = cluster.executor.run_job(dispatch).await.unwrap();
    assert!(!report.states.contains(&ExecutionState::Running));
    assert_eq!(report.final_state(), Some(JobState::Failed));

    let record = cluster.job(&job).await;
    assert_eq!(record.state, JobState::Failed);
    assert!(record.error_msg.unwrap().contains("failed to spawn"));
    assert_eq!(cluster.counter().await, Some(0));
    assert!(cluster.ledger.active_allocation(&job).await.unwrap().is_none());
}

#[tokio::test]
async fn environment_reaches_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.executor.working_dir = Some(dir.path().to_path_buf());
    let cluster = TestCluster::with_config(config);

    let spec = JobBuilder::new(5)
        .script(r#"printf '%s %s %s' "$GREETING" "$ARMADA_CPUS" "$ARMADA_JOB_ID" > out.txt"#)
        .env("GREETING", "hello")
        .build();
    let dispatch = dispatched(&cluster, spec).await;
    let job = dispatch.job_id.clone();

    let report = cluster.executor.run_job(dispatch).await.unwrap();
    assert_eq!(report.final_state(), Some(JobState::Completed));

    let output = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
    assert_eq!(output, format!("hello 5 {job}"));
}

#[tokio::test]
async fn duplicate_dispatch_is_ignored() {
    let cluster = TestCluster::new();
    let dispatch = dispatched(&cluster, JobBuilder::new(2).build()).await;
    let job = dispatch.job_id.clone();

    cluster.executor.run_job(dispatch.clone()).await.unwrap();
    let again = cluster.executor.run_job(dispatch).await.unwrap();

    assert!(matches!(again.outcome, ExecutionOutcome::Ignored { .. }));
    assert_eq!(again.states, vec![ExecutionState::Initialized]);
    assert_eq!(cluster.job(&job).await.state, JobState::Completed);
    assert_eq!(cluster.allocations(&job).await.len(), 1);
    assert_eq!(cluster.counter().await, Some(0));
}

#[tokio::test]
async fn dispatch_for_unknown_job_is_ignored() {
    let cluster = TestCluster::new();
    let dispatch = JobDispatch::from_job(&armada_state::JobRecord::pending(
        armada_state::JobId::new("no-such-job"),
        JobSpec::new(1, "true"),
    ));

    let report = cluster.executor.run_job(dispatch).await.unwrap();
    assert!(matches!(report.outcome, ExecutionOutcome::Ignored { .. }));
}

#[tokio::test]
async fn job_finished_before_start_is_superseded() {
    let cluster = TestCluster::new();
    let dispatch = dispatched(&cluster, JobBuilder::new(2).script(SLEEP_LONG).build()).await;
    let job = dispatch.job_id.clone();

    cluster
        .ledger
        .finish_job(&job, JobState::Cancelled, None, Some("cancelled before start"))
        .await
        .unwrap();

    let report = cluster.executor.run_job(dispatch).await.unwrap();
    assert_eq!(
        report.outcome,
        ExecutionOutcome::Superseded {
            state: JobState::Cancelled
        }
    );
    assert!(cluster.ledger.active_allocation(&job).await.unwrap().is_none());
    assert_eq!(cluster.counter().await, Some(0));
}

#[tokio::test]
async fn concurrent_jobs_charge_and_discharge_independently() {
    let cluster = TestCluster::new();
    cluster.add_worker("w1", 16).await;
    let a = cluster.submit(JobBuilder::new(4).script("sleep 0.5").build()).await;
    let b = cluster.submit(JobBuilder::new(6).script("sleep 0.5").build()).await;
    cluster.scheduler.tick().await.unwrap();

    let first = cluster.take().await.unwrap();
    let second = cluster.take().await.unwrap();
    let (ra, rb, ()) = tokio::join!(
        cluster.executor.run_job(first),
        cluster.executor.run_job(second),
        async {
            cluster.wait_until_running(&a).await;
            cluster.wait_until_running(&b).await;
            assert_eq!(cluster.counter().await, Some(10));
        }
    );

    assert_eq!(ra.unwrap().final_state(), Some(JobState::Completed));
    assert_eq!(rb.unwrap().final_state(), Some(JobState::Completed));
    assert_eq!(cluster.counter().await, Some(0));
}
