use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use data_model::{JobHandle, JobStatus, JobStatusReport, PhaseOrder};
use snap_utils::{poll_until, sleep_or_cancel, PollOutcome};
use state_store::JobController;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    settings::TimingSettings,
};

/// Result of waiting for a job to enter a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseWait {
    Reached(JobStatusReport),
    /// The job is already in a later phase.
    Passed(JobStatusReport),
    /// The job reached a terminal status first.
    Finished(JobStatusReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOutcome {
    Suspended,
    /// The job completed before the pause took effect.
    Finished,
    /// The job was neither running nor waiting, nothing was paused.
    NotActive(JobStatus),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuspendResumeReport {
    pub suspended: Vec<String>,
    pub skipped: Vec<String>,
    pub finished_early: bool,
}

/// Perturbs running jobs: waits for phases, suspends, dwells and resumes.
pub struct PhaseSuspendResumeController {
    jobs: Arc<dyn JobController>,
    timings: TimingSettings,
    metrics: Arc<metrics::Metrics>,
}

impl PhaseSuspendResumeController {
    pub fn new(
        jobs: Arc<dyn JobController>,
        timings: TimingSettings,
        metrics: Arc<metrics::Metrics>,
    ) -> Self {
        Self {
            jobs,
            timings,
            metrics,
        }
    }

    async fn phase_probe(
        &self,
        job: &JobHandle,
        phase: &str,
        order: &PhaseOrder,
    ) -> Result<Option<PhaseWait>> {
        let report = self.jobs.status(job).await?;
        debug!(
            job_id = %job.id,
            phase = %report.phase,
            status = %report.status,
            target = phase,
            "polled job phase"
        );
        if report.status.is_terminal() {
            return Ok(Some(PhaseWait::Finished(report)));
        }
        if report.phase_is(phase) {
            return Ok(Some(PhaseWait::Reached(report)));
        }
        if order.is_past(&report.phase, phase) {
            return Ok(Some(PhaseWait::Passed(report)));
        }
        Ok(None)
    }

    async fn timeout(&self, job: &JobHandle, target: &str, attempts: u32) -> Error {
        let (last_phase, last_status) = match self.jobs.status(job).await {
            Ok(report) => (report.phase, Some(report.status)),
            Err(_) => (String::new(), None),
        };
        Error::PhaseTimeout {
            job_id: job.id,
            target: target.to_string(),
            attempts,
            last_phase,
            last_status,
        }
    }

    /// Polls until `job` is in `phase`, is past it, or has finished. Waits on
    /// the default budget are extended once to the configured extended budget
    /// while the job is still running. Any other `max_attempts` is a hard
    /// limit.
    pub async fn wait_for_phase(
        &self,
        job: &JobHandle,
        phase: &str,
        order: &PhaseOrder,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<PhaseWait> {
        let extension = if max_attempts == self.timings.phase_poll_attempts {
            self.timings
                .phase_poll_extended_attempts
                .saturating_sub(max_attempts)
        } else {
            0
        };
        let mut budget = max_attempts;
        let mut spent = 0;
        let mut extended = false;
        loop {
            let policy = self.timings.phase_poll().with_max_attempts(budget);
            let outcome =
                poll_until(&policy, cancel, |_| self.phase_probe(job, phase, order)).await?;
            self.metrics.record_polls("phase_wait", outcome.attempts());
            spent += outcome.attempts();
            match outcome {
                PollOutcome::Ready { value, .. } => return Ok(value),
                PollOutcome::Cancelled { .. } => {
                    return Err(Error::cancelled(format!(
                        "waiting for job {} to reach phase {}",
                        job.id, phase
                    )))
                }
                PollOutcome::Exhausted { .. } => {}
            }

            let report = self.jobs.status(job).await?;
            if !extended && extension > 0 && report.status.is_active() {
                info!(
                    job_id = %job.id,
                    phase = %report.phase,
                    target = phase,
                    extension,
                    "job still running, extending phase wait"
                );
                extended = true;
                budget = extension;
                continue;
            }
            return Err(self.timeout(job, phase, spent).await);
        }
    }

    async fn suspend_probe(&self, job: &JobHandle) -> Result<Option<SuspendOutcome>> {
        let report = self.jobs.status(job).await?;
        match report.status {
            JobStatus::Suspended => Ok(Some(SuspendOutcome::Suspended)),
            JobStatus::Completed => Ok(Some(SuspendOutcome::Finished)),
            JobStatus::Killed | JobStatus::Failed | JobStatus::FailedToStart => {
                Err(Error::JobFailed {
                    job: *job,
                    status: report.status,
                    reason: report.reason().to_string(),
                })
            }
            JobStatus::Running | JobStatus::Waiting | JobStatus::Pending => Ok(None),
        }
    }

    /// Pauses `job` and waits for it to report `Suspended`. A job completing
    /// meanwhile is not an error.
    pub async fn suspend(
        &self,
        job: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<SuspendOutcome> {
        let report = self.jobs.status(job).await?;
        if report.status == JobStatus::Completed {
            return Ok(SuspendOutcome::Finished);
        }
        if !report.status.is_active() {
            info!(job_id = %job.id, status = %report.status, "job not running, not suspending");
            return Ok(SuspendOutcome::NotActive(report.status));
        }

        self.jobs.pause(job).await?;
        let outcome = poll_until(&self.timings.suspend_poll(), cancel, |_| {
            self.suspend_probe(job)
        })
        .await?;
        self.metrics.record_polls("suspend", outcome.attempts());
        match outcome {
            PollOutcome::Ready { value, attempts } => {
                info!(job_id = %job.id, phase = %report.phase, attempts, outcome = ?value, "suspend finished");
                Ok(value)
            }
            PollOutcome::Cancelled { .. } => Err(Error::cancelled(format!(
                "waiting for job {} to suspend",
                job.id
            ))),
            PollOutcome::Exhausted { attempts } => {
                Err(self.timeout(job, "suspended", attempts).await)
            }
        }
    }

    async fn resume_probe(&self, job: &JobHandle, retried: &AtomicBool) -> Result<Option<JobStatus>> {
        let report = self.jobs.status(job).await?;
        match report.status {
            JobStatus::Running | JobStatus::Waiting | JobStatus::Completed => Ok(Some(report.status)),
            JobStatus::Pending => {
                if !retried.swap(true, Ordering::SeqCst) {
                    warn!(job_id = %job.id, reason = report.reason(), "job pending after resume, resuming again");
                    self.jobs.resume(job).await?;
                }
                Ok(None)
            }
            JobStatus::Killed | JobStatus::Failed | JobStatus::FailedToStart => {
                Err(Error::JobFailed {
                    job: *job,
                    status: report.status,
                    reason: report.reason().to_string(),
                })
            }
            JobStatus::Suspended => Ok(None),
        }
    }

    /// Resumes `job` and waits until it runs again. A job landing in
    /// `Pending` is resumed once more.
    pub async fn resume(&self, job: &JobHandle, cancel: &CancellationToken) -> Result<JobStatus> {
        self.jobs.resume(job).await?;
        let retried = AtomicBool::new(false);
        let outcome = poll_until(&self.timings.resume_poll(), cancel, |_| {
            self.resume_probe(job, &retried)
        })
        .await?;
        self.metrics.record_polls("resume", outcome.attempts());
        match outcome {
            PollOutcome::Ready { value, .. } => {
                info!(job_id = %job.id, status = %value, "job resumed");
                Ok(value)
            }
            PollOutcome::Cancelled { .. } => Err(Error::cancelled(format!(
                "waiting for job {} to resume",
                job.id
            ))),
            PollOutcome::Exhausted { attempts } => Err(self.timeout(job, "running", attempts).await),
        }
    }

    async fn dwell(&self, job: &JobHandle, cancel: &CancellationToken) -> Result<()> {
        if !sleep_or_cancel(cancel, self.timings.suspend_dwell()).await {
            return Err(Error::cancelled(format!(
                "holding job {} suspended",
                job.id
            )));
        }
        Ok(())
    }

    /// Suspends `job`, holds it for the dwell time and resumes it. Returns
    /// `true` when the job finished along the way.
    async fn perturb(&self, job: &JobHandle, cancel: &CancellationToken) -> Result<Option<bool>> {
        match self.suspend(job, cancel).await? {
            SuspendOutcome::Suspended => {
                self.dwell(job, cancel).await?;
                let status = self.resume(job, cancel).await?;
                Ok(Some(status == JobStatus::Completed))
            }
            SuspendOutcome::Finished => Ok(Some(true)),
            SuspendOutcome::NotActive(_) => Ok(None),
        }
    }

    /// Suspends and resumes `job` once in each phase of `order`. Phases the
    /// job has already left are skipped. A job that finishes early ends the
    /// walk successfully.
    pub async fn run_suspend_resume(
        &self,
        job: &JobHandle,
        order: &PhaseOrder,
        cancel: &CancellationToken,
    ) -> Result<SuspendResumeReport> {
        let mut report = SuspendResumeReport::default();
        for phase in order.phases() {
            let wait = self
                .wait_for_phase(job, phase, order, self.timings.phase_poll_attempts, cancel)
                .await?;
            match wait {
                PhaseWait::Finished(status) => {
                    info!(job_id = %job.id, status = %status.status, "job finished, skipping remaining phases");
                    report.finished_early = true;
                    break;
                }
                PhaseWait::Passed(status) => {
                    info!(job_id = %job.id, current = %status.phase, skipped = phase, "phase already passed");
                    report.skipped.push(phase.clone());
                }
                PhaseWait::Reached(_) => match self.perturb(job, cancel).await? {
                    Some(finished) => {
                        report.suspended.push(phase.clone());
                        if finished {
                            report.finished_early = true;
                            break;
                        }
                    }
                    None => report.skipped.push(phase.clone()),
                },
            }
        }
        Ok(report)
    }

    /// Suspends and resumes `job` up to `cycles` times regardless of phase,
    /// letting it run for the dwell time between cycles.
    pub async fn suspend_resume_cycles(
        &self,
        job: &JobHandle,
        cycles: u32,
        cancel: &CancellationToken,
    ) -> Result<SuspendResumeReport> {
        let mut report = SuspendResumeReport::default();
        for cycle in 1..=cycles {
            let label = format!("cycle {}", cycle);
            match self.perturb(job, cancel).await? {
                Some(true) => {
                    report.suspended.push(label);
                    report.finished_early = true;
                    break;
                }
                Some(false) => report.suspended.push(label),
                None => report.skipped.push(label),
            }
            self.dwell(job, cancel).await?;
        }
        Ok(report)
    }
}
