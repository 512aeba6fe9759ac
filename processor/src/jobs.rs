use std::sync::Arc;

use data_model::{
    backup_copy_phases,
    BackupRequest,
    JobHandle,
    JobId,
    JobKind,
    JobRequest,
    JobStatus,
    JobStatusReport,
    ScenarioContext,
    StorageCopy,
    VolumeId,
};
use metrics::Timer;
use opentelemetry::KeyValue;
use snap_utils::{poll_until, PollOutcome};
use state_store::Backends;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    phase_controller::{PhaseSuspendResumeController, PhaseWait},
    settings::TimingSettings,
};

/// Submits backups, aux copies and backup copies and drives them to
/// completion, optionally perturbing them with suspend/resume on the way.
pub struct JobRunner {
    backends: Backends,
    phases: PhaseSuspendResumeController,
    timings: TimingSettings,
    metrics: Arc<metrics::Metrics>,
}

impl JobRunner {
    pub fn new(backends: Backends, timings: TimingSettings, metrics: Arc<metrics::Metrics>) -> Self {
        let phases =
            PhaseSuspendResumeController::new(backends.jobs.clone(), timings.clone(), metrics.clone());
        Self {
            backends,
            phases,
            timings,
            metrics,
        }
    }

    pub fn phases(&self) -> &PhaseSuspendResumeController {
        &self.phases
    }

    async fn terminal_probe(&self, job: &JobHandle) -> Result<Option<JobStatusReport>> {
        let report = self.backends.jobs.status(job).await?;
        debug!(job = %job, phase = %report.phase, status = %report.status, "polled job");
        Ok(report.status.is_terminal().then_some(report))
    }

    /// Polls `job` until it reaches a terminal status.
    pub async fn wait_for_completion(
        &self,
        job: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<JobStatusReport> {
        let labels = [KeyValue::new("kind", job.kind.to_string())];
        let _timer = Timer::start_with_labels(&self.metrics.job_wait_duration, &labels);
        let outcome =
            poll_until(&self.timings.job_poll(), cancel, |_| self.terminal_probe(job)).await?;
        self.metrics.record_polls("job_wait", outcome.attempts());
        match outcome {
            PollOutcome::Ready { value, .. } => Ok(value),
            PollOutcome::Cancelled { .. } => {
                Err(Error::cancelled(format!("waiting for job {}", job)))
            }
            PollOutcome::Exhausted { attempts } => {
                let report = self.backends.jobs.status(job).await?;
                Err(Error::JobTimeout {
                    job: *job,
                    attempts,
                    last_status: report.status,
                })
            }
        }
    }

    /// Like [`Self::wait_for_completion`] but any terminal status other than
    /// `Completed` is an error carrying the job's delay reason.
    pub async fn wait_for_success(
        &self,
        job: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<JobStatusReport> {
        let report = self.wait_for_completion(job, cancel).await?;
        if report.status != JobStatus::Completed {
            return Err(Error::JobFailed {
                job: *job,
                status: report.status,
                reason: report.reason().to_string(),
            });
        }
        info!(job = %job, "job completed");
        Ok(report)
    }

    async fn submit(&self, request: JobRequest) -> Result<JobHandle> {
        let job = self.backends.jobs.submit(request).await?;
        let report = self.backends.jobs.status(&job).await?;
        if report.status.is_terminal() && report.status != JobStatus::Completed {
            return Err(Error::JobFailed {
                job,
                status: report.status,
                reason: report.reason().to_string(),
            });
        }
        info!(job = %job, phase = %report.phase, "job started");
        Ok(job)
    }

    async fn volume_probe(&self, job_id: JobId, copy: &StorageCopy) -> Result<Option<Vec<VolumeId>>> {
        let volume_ids = self.backends.metadata.volume_ids(job_id, copy.id).await?;
        let volume_ids = volume_ids
            .into_iter()
            .filter(|v| !v.is_blank())
            .collect::<Vec<_>>();
        Ok((!volume_ids.is_empty()).then_some(volume_ids))
    }

    /// Waits for the metadata store to show a volume for `job_id` on `copy`.
    pub async fn confirm_snapshot(
        &self,
        job_id: JobId,
        copy: &StorageCopy,
        cancel: &CancellationToken,
    ) -> Result<Vec<VolumeId>> {
        let outcome = poll_until(&self.timings.post_op_poll(), cancel, |_| {
            self.volume_probe(job_id, copy)
        })
        .await?;
        self.metrics.record_polls("snapshot_created", outcome.attempts());
        match outcome {
            PollOutcome::Ready { value, .. } => Ok(value),
            PollOutcome::Cancelled { .. } => Err(Error::cancelled(format!(
                "waiting for snapshot of job {} on {}",
                job_id, copy.name
            ))),
            PollOutcome::Exhausted { .. } => Err(Error::SnapshotNotCreated {
                job_id,
                copy: copy.name.clone(),
            }),
        }
    }

    async fn primary_copy(&self, ctx: &ScenarioContext) -> Result<StorageCopy> {
        self.backends
            .copies
            .get_copy(&ctx.policy, &ctx.primary_copy)
            .await?
            .ok_or_else(|| Error::CopyNotFound {
                policy: ctx.policy.clone(),
                name: ctx.primary_copy.clone(),
            })
    }

    async fn backup_copy_probe(&self, job_id: JobId) -> Result<Option<JobId>> {
        Ok(self.backends.metadata.backup_copy_job(job_id).await?)
    }

    async fn wait_inline_backup_copy(
        &self,
        job_id: JobId,
        cancel: &CancellationToken,
    ) -> Result<JobHandle> {
        let outcome = poll_until(&self.timings.backup_copy_discovery(), cancel, |_| {
            self.backup_copy_probe(job_id)
        })
        .await?;
        let child = match outcome {
            PollOutcome::Ready { value, .. } => JobHandle::new(value, JobKind::BackupCopy),
            PollOutcome::Cancelled { .. } => {
                return Err(Error::cancelled(format!(
                    "looking for the backup copy of job {}",
                    job_id
                )))
            }
            PollOutcome::Exhausted { attempts } => {
                return Err(Error::BackupCopyNotFound { job_id, attempts })
            }
        };
        info!(job_id = %job_id, backup_copy = %child.id, "found inline backup copy");
        self.wait_for_success(&child, cancel).await?;
        Ok(child)
    }

    /// Runs a backup to completion, confirms its snapshot on the primary copy
    /// and records the job in the scenario.
    pub async fn run_backup(
        &self,
        ctx: &mut ScenarioContext,
        request: BackupRequest,
        suspend: bool,
    ) -> Result<JobHandle> {
        let cancel = ctx.cancel_token().clone();
        let primary = self.primary_copy(ctx).await?;
        let job = self.submit(JobRequest::Backup(request.clone())).await?;
        info!(job = %job, level = %request.level, copy = %primary.name, "running backup");

        if suspend {
            let report = self
                .phases
                .run_suspend_resume(&job, &request.phases(), &cancel)
                .await?;
            debug!(job = %job, ?report, "backup perturbed");
        }
        self.wait_for_success(&job, &cancel).await?;
        self.confirm_snapshot(job.id, &primary, &cancel).await?;
        ctx.track_job(job.id);

        if request.inline_backup_copy {
            self.wait_inline_backup_copy(job.id, &cancel).await?;
        }
        Ok(job)
    }

    /// Runs an aux copy for `copy_name`, or for every secondary copy when
    /// `None`.
    pub async fn run_aux_copy(
        &self,
        ctx: &ScenarioContext,
        copy_name: Option<&str>,
        suspend: bool,
    ) -> Result<JobHandle> {
        let cancel = ctx.cancel_token();
        let job = self
            .submit(JobRequest::AuxCopy {
                policy: ctx.policy.clone(),
                copy_name: copy_name.map(str::to_string),
                use_scale: true,
            })
            .await?;
        if suspend {
            let report = self
                .phases
                .suspend_resume_cycles(&job, self.timings.aux_copy_suspend_cycles, cancel)
                .await?;
            debug!(job = %job, ?report, "aux copy perturbed");
        }
        self.wait_for_success(&job, cancel).await?;
        Ok(job)
    }

    pub async fn run_backup_copy(&self, ctx: &ScenarioContext, suspend: bool) -> Result<JobHandle> {
        let cancel = ctx.cancel_token();
        let job = self
            .submit(JobRequest::BackupCopy {
                policy: ctx.policy.clone(),
            })
            .await?;
        if suspend {
            let report = self
                .phases
                .run_suspend_resume(&job, &backup_copy_phases(), cancel)
                .await?;
            debug!(job = %job, ?report, "backup copy perturbed");
        }
        self.wait_for_success(&job, cancel).await?;
        Ok(job)
    }

    /// Starts a backup and kills it once it is in `phase`. Fails when the job
    /// finishes, skips past the phase or sits pending before it can be
    /// killed.
    pub async fn kill_backup_in_phase(
        &self,
        ctx: &ScenarioContext,
        request: BackupRequest,
        phase: &str,
    ) -> Result<JobHandle> {
        let cancel = ctx.cancel_token();
        let job = self.submit(JobRequest::Backup(request.clone())).await?;
        let missed = |report: JobStatusReport| Error::KillMissed {
            job_id: job.id,
            phase: phase.to_string(),
            status: report.status,
        };
        match self
            .phases
            .wait_for_phase(&job, phase, &request.phases(), self.timings.phase_poll_attempts, cancel)
            .await?
        {
            PhaseWait::Reached(report) if report.status != JobStatus::Pending => {}
            PhaseWait::Reached(report) | PhaseWait::Passed(report) | PhaseWait::Finished(report) => {
                return Err(missed(report))
            }
        }

        self.backends.jobs.kill(&job).await?;
        let report = self.wait_for_completion(&job, cancel).await?;
        if report.status != JobStatus::Killed {
            return Err(missed(report));
        }
        info!(job = %job, phase, "killed job");
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use data_model::{
        test_objects::tests::{mock_backup_request, TEST_ARRAY_2, TEST_PRIMARY_COPY},
        BackupRequest,
        CopyKind,
        JobHandle,
        JobKind,
        JobStatus,
        Retention,
    };
    use state_store::{JobController, JobScript, MetadataStore};

    use crate::{error::Error, test_support::TestHarness};

    #[tokio::test(start_paused = true)]
    async fn test_backup_is_tracked_and_snapshotted() {
        let mut harness = TestHarness::new().await;
        let job = harness.backup().await;

        assert_eq!(harness.ctx.job_tracker, vec![job.id]);
        let primary = harness.primary().await;
        assert!(!harness
            .backend
            .volume_ids(job.id, primary.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_backup_is_not_tracked() {
        let mut harness = TestHarness::new().await;
        harness
            .backend
            .script_next(
                JobKind::Backup,
                JobScript::new([("backup", Duration::from_secs(60))], JobStatus::Failed)
                    .with_delay_reason("media agent offline"),
            )
            .await;

        let err = harness
            .engine
            .runner
            .run_backup(&mut harness.ctx, mock_backup_request(), false)
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::JobFailed { status: JobStatus::Failed, ref reason, .. } if reason == "media agent offline")
        );
        assert!(harness.ctx.job_tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_with_suspend_and_inline_backup_copy() {
        let mut harness = TestHarness::new().await;
        let request = BackupRequest {
            inline_backup_copy: true,
            ..Default::default()
        };
        let job = harness
            .engine
            .runner
            .run_backup(&mut harness.ctx, request, true)
            .await
            .unwrap();

        let child = harness
            .backend
            .backup_copy_job(job.id)
            .await
            .unwrap()
            .unwrap();
        let report = harness
            .backend
            .status(&JobHandle::new(child, JobKind::BackupCopy))
            .await
            .unwrap();
        assert_eq!(report.status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_backup_in_phase() {
        let harness = TestHarness::new().await;
        let job = harness
            .engine
            .runner
            .kill_backup_in_phase(&harness.ctx, mock_backup_request(), "scan")
            .await
            .unwrap();
        let report = harness.backend.status(&job).await.unwrap();
        assert_eq!(report.status, JobStatus::Killed);
        assert!(report.phase_is("scan"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_missed_when_phase_skipped() {
        let harness = TestHarness::new().await;
        let request = BackupRequest {
            skip_catalog: true,
            ..Default::default()
        };
        let err = harness
            .engine
            .runner
            .kill_backup_in_phase(&harness.ctx, request, "catalog")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KillMissed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aux_copy_with_suspend_cycles() {
        let mut harness = TestHarness::new().await;
        harness.backup().await;
        harness
            .engine
            .topology
            .create_copy(
                "Vault1",
                CopyKind::Vault,
                Some(TEST_PRIMARY_COPY),
                TEST_ARRAY_2,
                Retention::default(),
            )
            .await
            .unwrap();

        harness
            .engine
            .runner
            .run_aux_copy(&harness.ctx, None, true)
            .await
            .unwrap();
        let vault = harness.engine.topology.get_copy("Vault1").await.unwrap();
        let job_id = harness.ctx.job_tracker[0];
        assert!(!harness
            .backend
            .volume_ids(job_id, vault.id)
            .await
            .unwrap()
            .is_empty());
    }
}
