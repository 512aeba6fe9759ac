use std::sync::Arc;

use data_model::{
    CopyId,
    JobHandle,
    JobId,
    JobRequest,
    JobStatus,
    Retention,
    ScenarioContext,
    StorageCopy,
};
use itertools::Itertools;
use opentelemetry::KeyValue;
use snap_utils::{poll_until, sleep_or_cancel, PollOutcome};
use state_store::Backends;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    jobs::JobRunner,
    settings::TimingSettings,
};

const FAILED_TO_START: &str = "failed to start";

fn is_failed_to_start(message: &str) -> bool {
    message.to_ascii_lowercase().contains(FAILED_TO_START)
}

/// Sets copy retention, runs data aging and waits for pruning to show up in
/// the metadata store.
pub struct RetentionAgingEngine {
    backends: Backends,
    runner: Arc<JobRunner>,
    timings: TimingSettings,
    metrics: Arc<metrics::Metrics>,
}

impl RetentionAgingEngine {
    pub fn new(
        backends: Backends,
        runner: Arc<JobRunner>,
        timings: TimingSettings,
        metrics: Arc<metrics::Metrics>,
    ) -> Self {
        Self {
            backends,
            runner,
            timings,
            metrics,
        }
    }

    async fn copy(&self, policy: &str, name: &str) -> Result<StorageCopy> {
        self.backends
            .copies
            .get_copy(policy, name)
            .await?
            .ok_or_else(|| Error::CopyNotFound {
                policy: policy.to_string(),
                name: name.to_string(),
            })
    }

    pub async fn set_retention(&self, policy: &str, copy_name: &str, retention: Retention) -> Result<()> {
        let copy = self.copy(policy, copy_name).await?;
        self.backends
            .copies
            .update_retention(policy, copy_name, retention)
            .await?;
        info!(copy = copy_name, from = %copy.retention, to = %retention, "retention updated");
        Ok(())
    }

    /// Submits data aging for `copy_name` and waits for it to complete. Jobs
    /// that fail to start are resubmitted on the aging retry schedule.
    pub async fn run_aging(&self, ctx: &mut ScenarioContext, copy_name: &str) -> Result<JobHandle> {
        let cancel = ctx.cancel_token().clone();
        self.copy(&ctx.policy, copy_name).await?;
        let retry = self.timings.aging_retry();
        let mut attempts = 0;
        let job = loop {
            attempts += 1;
            let request = JobRequest::DataAging {
                policy: ctx.policy.clone(),
                copy_name: copy_name.to_string(),
            };
            let reason = match self.backends.jobs.submit(request).await {
                Ok(job) => {
                    let report = self.backends.jobs.status(&job).await?;
                    if report.status != JobStatus::FailedToStart {
                        break job;
                    }
                    report.reason().to_string()
                }
                Err(err) if is_failed_to_start(&err.to_string()) => err.to_string(),
                Err(err) => return Err(err.into()),
            };
            if attempts >= retry.max_attempts {
                return Err(Error::AgingFailedToStart {
                    copy: copy_name.to_string(),
                    attempts,
                });
            }
            warn!(copy = copy_name, attempts, %reason, "data aging failed to start, retrying");
            if !sleep_or_cancel(&cancel, retry.interval).await {
                return Err(Error::cancelled(format!(
                    "waiting to resubmit data aging for {}",
                    copy_name
                )));
            }
        };

        info!(job = %job, copy = copy_name, attempts, "data aging started");
        self.runner.wait_for_success(&job, &cancel).await?;
        ctx.record_aging(copy_name, job.id);
        Ok(job)
    }

    /// Whether an aging run recorded in `ctx` prunes `copy`: one ran on the
    /// copy itself or, for mirrors, on a copy up its mirror chain.
    async fn aging_covers(&self, ctx: &ScenarioContext, copy: &StorageCopy) -> Result<bool> {
        let mut current = copy.clone();
        loop {
            if ctx.aging_ran_for(&current.name) {
                return Ok(true);
            }
            match (&current.source_copy, current.kind.is_mirror()) {
                (Some(source), true) => current = self.copy(&ctx.policy, source).await?,
                _ => return Ok(false),
            }
        }
    }

    async fn unpruned(&self, job_ids: &[JobId], copy_id: CopyId) -> Result<Vec<JobId>> {
        let mut remaining = Vec::new();
        for job_id in job_ids {
            let volume_ids = self.backends.metadata.volume_ids(*job_id, copy_id).await?;
            if volume_ids.iter().any(|v| !v.is_blank()) {
                remaining.push(*job_id);
            }
        }
        Ok(remaining)
    }

    async fn pruned_probe(&self, job_ids: &[JobId], copy_id: CopyId) -> Result<Option<()>> {
        let remaining = self.unpruned(job_ids, copy_id).await?;
        debug!(remaining = %remaining.iter().join(","), "polled pruning");
        Ok(remaining.is_empty().then_some(()))
    }

    /// Waits until none of `job_ids` has a volume on `copy_name`. All jobs
    /// share one poll budget.
    pub async fn verify_pruned(
        &self,
        ctx: &ScenarioContext,
        job_ids: &[JobId],
        copy_name: &str,
    ) -> Result<()> {
        let copy = self.copy(&ctx.policy, copy_name).await?;
        if let Some(job_id) = job_ids.iter().find(|id| !ctx.job_tracker.contains(*id)) {
            return Err(Error::UntrackedJob { job_id: *job_id });
        }
        if !self.aging_covers(ctx, &copy).await? {
            return Err(Error::AgingNotRun {
                copy: copy_name.to_string(),
            });
        }
        if job_ids.is_empty() {
            return Ok(());
        }

        let policy = self.timings.pruning_poll();
        let outcome = poll_until(&policy, ctx.cancel_token(), |_| {
            self.pruned_probe(job_ids, copy.id)
        })
        .await?;
        self.metrics.record_polls("pruning", outcome.attempts());
        match outcome {
            PollOutcome::Ready { attempts, .. } => {
                info!(copy = copy_name, jobs = job_ids.len(), attempts, "snapshots pruned");
                Ok(())
            }
            PollOutcome::Cancelled { .. } => Err(Error::cancelled(format!(
                "waiting for pruning on {}",
                copy_name
            ))),
            PollOutcome::Exhausted { .. } => {
                let remaining = self.unpruned(job_ids, copy.id).await?;
                let Some(first) = remaining.first().copied() else {
                    return Ok(());
                };
                self.metrics.pruning_timeouts.add(
                    remaining.len() as u64,
                    &[KeyValue::new("copy", copy_name.to_string())],
                );
                Err(Error::PruningTimeout {
                    job_id: first,
                    copy: copy_name.to_string(),
                    remaining,
                    waited: policy.ceiling(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use data_model::{
        test_objects::tests::{TEST_ARRAY_2, TEST_PRIMARY_COPY},
        CopyKind,
        JobId,
        JobKind,
        JobStatus,
        ReplicaMode,
        Retention,
    };
    use state_store::{CopyPersistence, JobScript, SimSettings};

    use super::is_failed_to_start;
    use crate::{error::Error, settings::TimingSettings, test_support::TestHarness};

    #[test]
    fn test_failed_to_start_detection() {
        assert!(is_failed_to_start("Job Failed to Start: no resources"));
        assert!(!is_failed_to_start("job failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aging_prunes_all_but_last_cycle() {
        let mut harness = TestHarness::new().await;
        let mut jobs = Vec::new();
        for _ in 0..4 {
            jobs.push(harness.backup().await.id);
        }
        let engine = &harness.engine.retention;
        engine
            .set_retention(&harness.ctx.policy, TEST_PRIMARY_COPY, Retention::single_cycle())
            .await
            .unwrap();
        engine.run_aging(&mut harness.ctx, TEST_PRIMARY_COPY).await.unwrap();

        engine
            .verify_pruned(&harness.ctx, &jobs[..2], TEST_PRIMARY_COPY)
            .await
            .unwrap();
        let err = engine
            .verify_pruned(&harness.ctx, &jobs[2..], TEST_PRIMARY_COPY)
            .await
            .unwrap_err();
        match err {
            Error::PruningTimeout {
                job_id, remaining, ..
            } => {
                assert_eq!(job_id, jobs[2]);
                assert_eq!(remaining, jobs[2..].to_vec());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_requires_aging_and_tracked_jobs() {
        let mut harness = TestHarness::new().await;
        let job = harness.backup().await;
        let engine = &harness.engine.retention;

        let err = engine
            .verify_pruned(&harness.ctx, &[job.id], TEST_PRIMARY_COPY)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgingNotRun { .. }));

        let err = engine
            .verify_pruned(&harness.ctx, &[JobId::new(1)], TEST_PRIMARY_COPY)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UntrackedJob { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aging_on_source_covers_mirror() {
        let mut harness = TestHarness::new().await;
        harness
            .engine
            .topology
            .create_copy(
                "Mirror1",
                CopyKind::Replica(ReplicaMode::Mirror),
                Some(TEST_PRIMARY_COPY),
                TEST_ARRAY_2,
                Retention::default(),
            )
            .await
            .unwrap();
        let mut jobs = Vec::new();
        for _ in 0..3 {
            jobs.push(harness.backup().await.id);
        }
        harness
            .engine
            .runner
            .run_aux_copy(&harness.ctx, None, false)
            .await
            .unwrap();

        let engine = &harness.engine.retention;
        engine
            .set_retention(&harness.ctx.policy, TEST_PRIMARY_COPY, Retention::spool())
            .await
            .unwrap();
        engine.run_aging(&mut harness.ctx, TEST_PRIMARY_COPY).await.unwrap();
        engine
            .verify_pruned(&harness.ctx, &jobs, "Mirror1")
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_aging_retries_failed_starts() {
        let mut harness = TestHarness::new().await;
        harness.backup().await;
        harness.backend.fail_aging_starts(3).await;

        let job = harness
            .engine
            .retention
            .run_aging(&mut harness.ctx, TEST_PRIMARY_COPY)
            .await
            .unwrap();
        assert_eq!(harness.ctx.aging_runs.get(TEST_PRIMARY_COPY), Some(&job.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aging_gives_up_after_retry_budget() {
        let timings = TimingSettings {
            aging_retry_attempts: 2,
            ..Default::default()
        };
        let mut harness = TestHarness::with_settings(SimSettings::default(), timings).await;
        harness.backend.fail_aging_starts(5).await;

        let err = harness
            .engine
            .retention
            .run_aging(&mut harness.ctx, TEST_PRIMARY_COPY)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgingFailedToStart { attempts: 2, .. }));
        assert!(!harness.ctx.aging_ran_for(TEST_PRIMARY_COPY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_aging_job_is_not_recorded() {
        let mut harness = TestHarness::new().await;
        harness
            .backend
            .script_next(
                JobKind::DataAging,
                JobScript::new([("data aging", Duration::from_secs(30))], JobStatus::Failed),
            )
            .await;

        let err = harness
            .engine
            .retention
            .run_aging(&mut harness.ctx, TEST_PRIMARY_COPY)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JobFailed { .. }));
        assert!(harness.ctx.aging_runs.is_empty());
        let copy = harness
            .backend
            .get_copy(&harness.ctx.policy, TEST_PRIMARY_COPY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(copy.retention, Retention::default());
    }
}
