use std::{path::PathBuf, sync::Arc};

use data_model::{
    ArrayOpKind,
    ArrayOperation,
    ContentLocation,
    ControlHostId,
    CopyId,
    JobHandle,
    JobId,
    MountSpec,
    Snapshot,
    SnapshotState,
    StorageCopy,
};
use snap_utils::{poll_until, sleep_or_cancel, PollOutcome};
use state_store::Backends;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    jobs::JobRunner,
    settings::TimingSettings,
};

/// What a lifecycle transition did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub op: ArrayOpKind,
    /// The array job, `None` when the transition needed no array call.
    pub job: Option<JobHandle>,
    pub state: SnapshotState,
    /// Whether the metadata store reflected the transition before returning.
    pub confirmed: bool,
    /// Mount paths created by a mount or removed by an unmount.
    pub mount_paths: Vec<PathBuf>,
}

impl TransitionOutcome {
    fn noop(op: ArrayOpKind, state: SnapshotState) -> Self {
        Self {
            op,
            job: None,
            state,
            confirmed: true,
            mount_paths: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.job.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub reconciled: Vec<(String, ControlHostId)>,
    /// Arrays sharing a control host with one already reconciled.
    pub skipped: Vec<String>,
}

/// Drives snapshots through mount, unmount, revert and delete on the array,
/// confirming every transition against the metadata store.
pub struct SnapshotLifecycleOrchestrator {
    backends: Backends,
    runner: Arc<JobRunner>,
    timings: TimingSettings,
    metrics: Arc<metrics::Metrics>,
}

impl SnapshotLifecycleOrchestrator {
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

    pub async fn snapshot(&self, job_id: JobId, copy_id: CopyId) -> Result<Snapshot> {
        let volume_ids = self.backends.metadata.volume_ids(job_id, copy_id).await?;
        let mount_paths = self.backends.metadata.mount_paths(job_id, copy_id).await?;
        Ok(Snapshot::new(job_id, copy_id, volume_ids, mount_paths))
    }

    pub async fn snapshot_state(&self, job_id: JobId, copy_id: CopyId) -> Result<SnapshotState> {
        Ok(self.snapshot(job_id, copy_id).await?.observed_state())
    }

    /// Waits for the snapshot of `job_id` to show up on `copy`.
    pub async fn wait_for_created(
        &self,
        job_id: JobId,
        copy: &StorageCopy,
        cancel: &CancellationToken,
    ) -> Result<Snapshot> {
        self.runner.confirm_snapshot(job_id, copy, cancel).await?;
        self.snapshot(job_id, copy.id).await
    }

    async fn matching_probe<F>(&self, job_id: JobId, copy_id: CopyId, pred: &F) -> Result<Option<Snapshot>>
    where
        F: Fn(&Snapshot) -> bool,
    {
        let snapshot = self.snapshot(job_id, copy_id).await?;
        debug!(%snapshot, "polled snapshot");
        Ok(pred(&snapshot).then_some(snapshot))
    }

    async fn await_snapshot<F>(
        &self,
        job_id: JobId,
        copy_id: CopyId,
        pred: F,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome<Snapshot>>
    where
        F: Fn(&Snapshot) -> bool,
    {
        let outcome = poll_until(&self.timings.post_op_poll(), cancel, |_| {
            self.matching_probe(job_id, copy_id, &pred)
        })
        .await?;
        self.metrics.record_polls("post_condition", outcome.attempts());
        Ok(outcome)
    }

    async fn execute(&self, op: ArrayOperation, cancel: &CancellationToken) -> Result<JobHandle> {
        let kind = op.kind();
        info!(op = %op, "submitting array operation");
        let job = match self.backends.array.execute(op).await {
            Ok(job) => job,
            Err(err) => {
                self.metrics.record_array_op(kind.as_ref(), "rejected");
                return Err(err.into());
            }
        };
        if let Err(err) = self.runner.wait_for_success(&job, cancel).await {
            self.metrics.record_array_op(kind.as_ref(), "failed");
            return Err(err);
        }
        self.metrics.record_array_op(kind.as_ref(), "completed");

        if !sleep_or_cancel(cancel, self.timings.post_op_settle()).await {
            return Err(Error::cancelled(format!("settling after {}", kind)));
        }
        Ok(job)
    }

    fn confirmed_or_timeout(
        op: ArrayOpKind,
        job_id: JobId,
        copy_id: CopyId,
        outcome: PollOutcome<Snapshot>,
    ) -> Result<Snapshot> {
        match outcome {
            PollOutcome::Ready { value, .. } => Ok(value),
            PollOutcome::Cancelled { .. } => Err(Error::cancelled(format!(
                "confirming {} of job {} on copy {}",
                op, job_id, copy_id
            ))),
            PollOutcome::Exhausted { attempts } => Err(Error::PostConditionTimeout {
                op,
                job_id,
                copy_id,
                attempts,
            }),
        }
    }

    /// Mounts the snapshot and waits for its mount path to be recorded.
    pub async fn mount(
        &self,
        job_id: JobId,
        copy_id: CopyId,
        spec: &MountSpec,
        cancel: &CancellationToken,
    ) -> Result<TransitionOutcome> {
        let op = ArrayOpKind::Mount;
        let snapshot = self.snapshot(job_id, copy_id).await?;
        if !snapshot.has_volume() {
            return Err(Error::VolumeMissing {
                op,
                job_id,
                copy_id,
            });
        }
        if snapshot.observed_state() == SnapshotState::Mounted {
            return Err(Error::InvalidTransition {
                op,
                job_id,
                copy_id,
                state: SnapshotState::Mounted,
            });
        }

        let job = self
            .execute(
                ArrayOperation::Mount {
                    volume_ids: snapshot.volume_ids,
                    spec: spec.clone(),
                },
                cancel,
            )
            .await?;
        let outcome = self
            .await_snapshot(job_id, copy_id, |s| !s.mount_paths.is_empty(), cancel)
            .await?;
        let mounted = Self::confirmed_or_timeout(op, job_id, copy_id, outcome)?;
        info!(%job_id, %copy_id, host = %spec.host, paths = ?mounted.mount_paths, "snapshot mounted");
        Ok(TransitionOutcome {
            op,
            job: Some(job),
            state: SnapshotState::Mounted,
            confirmed: true,
            mount_paths: mounted.mount_paths,
        })
    }

    pub async fn unmount(
        &self,
        job_id: JobId,
        copy_id: CopyId,
        cancel: &CancellationToken,
    ) -> Result<TransitionOutcome> {
        self.unmount_with(ArrayOpKind::Unmount, job_id, copy_id, cancel)
            .await
    }

    pub async fn force_unmount(
        &self,
        job_id: JobId,
        copy_id: CopyId,
        cancel: &CancellationToken,
    ) -> Result<TransitionOutcome> {
        self.unmount_with(ArrayOpKind::ForceUnmount, job_id, copy_id, cancel)
            .await
    }

    async fn unmount_with(
        &self,
        op: ArrayOpKind,
        job_id: JobId,
        copy_id: CopyId,
        cancel: &CancellationToken,
    ) -> Result<TransitionOutcome> {
        let snapshot = self.snapshot(job_id, copy_id).await?;
        if !snapshot.has_volume() {
            return Err(Error::VolumeMissing {
                op,
                job_id,
                copy_id,
            });
        }
        if snapshot.mount_paths.is_empty() {
            info!(%job_id, %copy_id, %op, "snapshot not mounted, nothing to unmount");
            return Ok(TransitionOutcome::noop(op, SnapshotState::Created));
        }

        let mount_paths = snapshot.mount_paths.clone();
        let job = self
            .execute(ArrayOperation::for_volumes(op, snapshot.volume_ids)?, cancel)
            .await?;
        let outcome = self
            .await_snapshot(job_id, copy_id, |s| s.mount_paths.is_empty(), cancel)
            .await?;
        Self::confirmed_or_timeout(op, job_id, copy_id, outcome)?;
        info!(%job_id, %copy_id, %op, paths = ?mount_paths, "snapshot unmounted");
        Ok(TransitionOutcome {
            op,
            job: Some(job),
            state: SnapshotState::Unmounted,
            confirmed: true,
            mount_paths,
        })
    }

    /// Reverts the source volumes to the snapshot. Every location in
    /// `cleared` must be empty and the snapshot must not be mounted.
    pub async fn revert(
        &self,
        job_id: JobId,
        copy_id: CopyId,
        cleared: &[ContentLocation],
        cancel: &CancellationToken,
    ) -> Result<TransitionOutcome> {
        let op = ArrayOpKind::Revert;
        let snapshot = self.snapshot(job_id, copy_id).await?;
        if !snapshot.has_volume() {
            return Err(Error::VolumeMissing {
                op,
                job_id,
                copy_id,
            });
        }
        if snapshot.observed_state() == SnapshotState::Mounted {
            return Err(Error::RevertPrecondition {
                job_id,
                copy_id,
                reason: "snapshot is mounted".to_string(),
            });
        }
        for location in cleared {
            if !self.backends.mount_host.is_cleared(location).await? {
                return Err(Error::RevertPrecondition {
                    job_id,
                    copy_id,
                    reason: format!("{} has not been cleared", location),
                });
            }
        }

        let job = self
            .execute(ArrayOperation::for_volumes(op, snapshot.volume_ids)?, cancel)
            .await?;
        info!(%job_id, %copy_id, "snapshot reverted");
        Ok(TransitionOutcome {
            op,
            job: Some(job),
            state: SnapshotState::Reverted,
            confirmed: true,
            mount_paths: Vec::new(),
        })
    }

    pub async fn delete(
        &self,
        job_id: JobId,
        copy_id: CopyId,
        cancel: &CancellationToken,
    ) -> Result<TransitionOutcome> {
        self.delete_with(ArrayOpKind::Delete, job_id, copy_id, cancel)
            .await
    }

    pub async fn force_delete(
        &self,
        job_id: JobId,
        copy_id: CopyId,
        cancel: &CancellationToken,
    ) -> Result<TransitionOutcome> {
        self.delete_with(ArrayOpKind::ForceDelete, job_id, copy_id, cancel)
            .await
    }

    /// Deletes the snapshot. A snapshot without a volume is already gone. The
    /// metadata store may lag behind the array, so an unconfirmed delete is
    /// reported rather than failed.
    async fn delete_with(
        &self,
        op: ArrayOpKind,
        job_id: JobId,
        copy_id: CopyId,
        cancel: &CancellationToken,
    ) -> Result<TransitionOutcome> {
        let snapshot = self.snapshot(job_id, copy_id).await?;
        if !snapshot.has_volume() {
            info!(%job_id, %copy_id, %op, "no volume, nothing to delete");
            return Ok(TransitionOutcome::noop(op, SnapshotState::Absent));
        }

        let job = self
            .execute(ArrayOperation::for_volumes(op, snapshot.volume_ids)?, cancel)
            .await?;
        let confirmed = match self
            .await_snapshot(job_id, copy_id, |s| !s.has_volume(), cancel)
            .await?
        {
            PollOutcome::Ready { .. } => true,
            PollOutcome::Cancelled { .. } => {
                return Err(Error::cancelled(format!(
                    "confirming {} of job {} on copy {}",
                    op, job_id, copy_id
                )))
            }
            PollOutcome::Exhausted { attempts } => {
                warn!(%job_id, %copy_id, %op, attempts, "volume still listed after delete");
                false
            }
        };
        info!(%job_id, %copy_id, %op, confirmed, "snapshot deleted");
        Ok(TransitionOutcome {
            op,
            job: Some(job),
            state: SnapshotState::Deleted,
            confirmed,
            mount_paths: Vec::new(),
        })
    }

    /// Reconciles each distinct control host behind `arrays`, pausing between
    /// hosts. Every host is attempted; failures are collected and raised
    /// together.
    pub async fn reconcile(
        &self,
        arrays: &[String],
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut failed = Vec::new();
        let mut hosts: Vec<(String, ControlHostId)> = Vec::new();
        for array in arrays {
            match self.backends.metadata.control_host_id(array).await {
                Ok(host) if hosts.iter().any(|(_, h)| *h == host) => {
                    report.skipped.push(array.clone())
                }
                Ok(host) => hosts.push((array.clone(), host)),
                Err(err) => failed.push((array.clone(), err.to_string())),
            }
        }

        for (idx, (array, host)) in hosts.into_iter().enumerate() {
            if idx > 0 && !sleep_or_cancel(cancel, self.timings.reconcile_pause()).await {
                return Err(Error::cancelled("pausing between reconciles"));
            }
            match self
                .execute(ArrayOperation::Reconcile { control_host: host }, cancel)
                .await
            {
                Ok(_) => {
                    info!(array = %array, control_host = %host, "array reconciled");
                    report.reconciled.push((array, host));
                }
                Err(err @ Error::Cancelled { .. }) => return Err(err),
                Err(err) => {
                    warn!(array = %array, control_host = %host, %err, "reconcile failed");
                    failed.push((array, err.to_string()));
                }
            }
        }

        if !failed.is_empty() {
            return Err(Error::ReconcileFailed { failed });
        }
        Ok(report)
    }

    /// Reconciles every array holding a snapshot of `job_id`.
    pub async fn reconcile_job(
        &self,
        job_id: JobId,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport> {
        let arrays = self.backends.metadata.arrays_for_job(job_id).await?;
        if arrays.is_empty() {
            warn!(%job_id, "job has no snapshots on any array, nothing to reconcile");
            return Ok(ReconcileReport::default());
        }
        self.reconcile(&arrays, cancel).await
    }
}
