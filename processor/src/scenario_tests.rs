use std::time::Duration;

use data_model::{
    test_objects::tests::{
        mock_backup_request,
        mock_mount_spec,
        TEST_ARRAY,
        TEST_MOUNT_HOST,
        TEST_PRIMARY_COPY,
    },
    CopyKind,
    JobKind,
    JobRequest,
    JobStatus,
    Retention,
    SnapshotState,
};
use state_store::{JobController, JobScript};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{error::Error, phase_controller::PhaseWait, test_support::TestHarness};

#[tokio::test(start_paused = true)]
async fn test_backup_mount_unmount_roundtrip() {
    let mut harness = TestHarness::new().await;
    let copy = harness.primary().await;
    let cancel = CancellationToken::new();
    let lifecycle = harness.engine.lifecycle.clone();

    let job = harness.backup().await;
    assert_eq!(
        lifecycle.snapshot_state(job.id, copy.id).await.unwrap(),
        SnapshotState::Created
    );

    let mounted = lifecycle
        .mount(job.id, copy.id, &mock_mount_spec(), &cancel)
        .await
        .unwrap();
    assert!(!mounted.mount_paths.is_empty());
    harness.ctx.mount_paths = mounted.mount_paths.clone();

    let unmounted = lifecycle.unmount(job.id, copy.id, &cancel).await.unwrap();
    assert_eq!(unmounted.state, SnapshotState::Unmounted);
    assert!(lifecycle
        .snapshot(job.id, copy.id)
        .await
        .unwrap()
        .mount_paths
        .is_empty());
    harness
        .engine
        .validation
        .validate_unmount(TEST_MOUNT_HOST, &harness.ctx.mount_paths)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_chain_rejects_edge_back_to_root() {
    let harness = TestHarness::new().await;
    let topology = &harness.engine.topology;
    topology
        .create_copy(
            "Vault1",
            CopyKind::Vault,
            Some(TEST_PRIMARY_COPY),
            TEST_ARRAY,
            Retention::default(),
        )
        .await
        .unwrap();
    topology
        .create_copy(
            "Mirror1",
            CopyKind::Mirror,
            Some("Vault1"),
            TEST_ARRAY,
            Retention::default(),
        )
        .await
        .unwrap();

    let chain = topology
        .copies()
        .await
        .unwrap()
        .into_iter()
        .map(|c| (c.name, c.source_copy))
        .collect::<Vec<_>>();
    assert_eq!(
        chain,
        vec![
            (TEST_PRIMARY_COPY.to_string(), None),
            ("Vault1".to_string(), Some(TEST_PRIMARY_COPY.to_string())),
            ("Mirror1".to_string(), Some("Vault1".to_string())),
        ]
    );

    let res = topology
        .create_copy(
            TEST_PRIMARY_COPY,
            CopyKind::Snap,
            Some("Mirror1"),
            TEST_ARRAY,
            Retention::default(),
        )
        .await;
    assert!(matches!(res, Err(Error::TopologyCycle { .. })));
    assert_eq!(topology.copies().await.unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_single_cycle_aging_prunes_older_jobs() {
    let mut harness = TestHarness::new().await;
    let mut jobs = Vec::new();
    for _ in 0..4 {
        jobs.push(harness.backup().await.id);
    }
    let retention = &harness.engine.retention;
    retention
        .set_retention(&harness.ctx.policy, TEST_PRIMARY_COPY, Retention::new(0, 1, 0))
        .await
        .unwrap();
    retention
        .run_aging(&mut harness.ctx, TEST_PRIMARY_COPY)
        .await
        .unwrap();

    retention
        .verify_pruned(&harness.ctx, &jobs[..2], TEST_PRIMARY_COPY)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pruning_timeout_names_stuck_job() {
    let mut harness = TestHarness::new().await;
    let mut jobs = Vec::new();
    for _ in 0..4 {
        jobs.push(harness.backup().await.id);
    }
    harness.backend.stick_snapshots(jobs[1]).await;
    let retention = &harness.engine.retention;
    retention
        .set_retention(&harness.ctx.policy, TEST_PRIMARY_COPY, Retention::new(0, 1, 0))
        .await
        .unwrap();
    retention
        .run_aging(&mut harness.ctx, TEST_PRIMARY_COPY)
        .await
        .unwrap();

    let start = Instant::now();
    let err = retention
        .verify_pruned(&harness.ctx, &jobs[..2], TEST_PRIMARY_COPY)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PruningTimeout { job_id, .. } if job_id == jobs[1]));
    assert_eq!(start.elapsed(), Duration::from_secs(19 * 120));
}

#[tokio::test(start_paused = true)]
async fn test_delete_twice_is_noop() {
    let mut harness = TestHarness::new().await;
    let job = harness.backup().await;
    let copy = harness.primary().await;
    let lifecycle = &harness.engine.lifecycle;
    let cancel = CancellationToken::new();

    lifecycle.delete(job.id, copy.id, &cancel).await.unwrap();
    let calls = harness.backend.array_calls().await.len();
    let again = lifecycle.delete(job.id, copy.id, &cancel).await.unwrap();
    assert!(again.is_noop());
    assert_eq!(harness.backend.array_calls().await.len(), calls);
}

#[tokio::test(start_paused = true)]
async fn test_state_is_read_from_metadata() {
    let mut harness = TestHarness::new().await;
    let job = harness.backup().await;
    let copy = harness.primary().await;
    let lifecycle = &harness.engine.lifecycle;
    let cancel = CancellationToken::new();

    lifecycle
        .mount(job.id, copy.id, &mock_mount_spec(), &cancel)
        .await
        .unwrap();
    harness.backend.external_unmount(job.id, copy.id).await;
    assert_eq!(
        lifecycle.snapshot_state(job.id, copy.id).await.unwrap(),
        SnapshotState::Created
    );

    let unmounted = lifecycle.unmount(job.id, copy.id, &cancel).await.unwrap();
    assert!(unmounted.is_noop());
}

#[tokio::test(start_paused = true)]
async fn test_never_suspends_for_earlier_phase() {
    let harness = TestHarness::new().await;
    harness
        .backend
        .script_next(
            JobKind::Backup,
            JobScript::new(
                [
                    ("catalog", Duration::from_secs(60)),
                    ("archive index", Duration::from_secs(60)),
                ],
                JobStatus::Completed,
            ),
        )
        .await;
    let job = harness
        .backend
        .submit(JobRequest::Backup(mock_backup_request()))
        .await
        .unwrap();

    let report = harness
        .engine
        .runner
        .phases()
        .run_suspend_resume(&job, &mock_backup_request().phases(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.skipped, vec!["backup", "scan"]);
    assert_eq!(report.suspended, vec!["catalog", "archive index"]);
}

#[tokio::test(start_paused = true)]
async fn test_phase_already_past_skips_suspend() {
    let harness = TestHarness::new().await;
    harness
        .backend
        .script_next(
            JobKind::Backup,
            JobScript::new(
                [("archive index", Duration::from_secs(3600))],
                JobStatus::Completed,
            ),
        )
        .await;
    let job = harness
        .backend
        .submit(JobRequest::Backup(mock_backup_request()))
        .await
        .unwrap();
    let phases = harness.engine.runner.phases();
    let order = mock_backup_request().phases();
    let start = Instant::now();

    let wait = phases
        .wait_for_phase(&job, "backup", &order, 3, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(wait, PhaseWait::Passed(_)));
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(
        harness.backend.status(&job).await.unwrap().status,
        JobStatus::Running
    );
}

#[tokio::test(start_paused = true)]
async fn test_scenario_deadline_aborts_nested_waits() {
    let mut harness = TestHarness::new().await;
    let cancel = CancellationToken::new();
    harness.ctx = harness.ctx.clone().with_cancellation(cancel.clone());
    let _deadline = snap_utils::cancel_after(&cancel, Duration::from_secs(90));

    let err = harness
        .engine
        .runner
        .run_backup(&mut harness.ctx, mock_backup_request(), true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled { .. }));
    assert!(harness.ctx.job_tracker.is_empty());
}
