use std::{path::PathBuf, sync::Arc};

use data_model::{
    ArrayOpKind,
    ContentDigest,
    ContentLocation,
    CopyId,
    JobId,
    Retention,
    ScenarioContext,
    Snapshot,
};
use snap_utils::{poll_until, PollOutcome};
use state_store::Backends;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    retention::RetentionAgingEngine,
    settings::{AgingSettings, MirrorAgingTarget, TimingSettings},
};

/// Result of an aging validation on one copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgingReport {
    pub copy: String,
    /// Copy retention was set on and aging ran against.
    pub aged_copy: String,
    pub retention: Retention,
    pub pruned: Vec<JobId>,
    pub retained: Vec<JobId>,
}

/// Checks that transitions had the effect they claim: mounted content
/// matches, unmounts leave nothing behind, deletes and reverts stick, and
/// aging prunes what retention says it should.
pub struct ValidationEngine {
    backends: Backends,
    retention: Arc<RetentionAgingEngine>,
    timings: TimingSettings,
    aging: AgingSettings,
}

impl ValidationEngine {
    pub fn new(
        backends: Backends,
        retention: Arc<RetentionAgingEngine>,
        timings: TimingSettings,
        aging: AgingSettings,
    ) -> Self {
        Self {
            backends,
            retention,
            timings,
            aging,
        }
    }

    async fn compare(&self, location: &ContentLocation, expected: &ContentDigest) -> Result<()> {
        let actual = self.backends.mount_host.digest(location).await?;
        let diffs = expected.diff(&actual);
        if !diffs.is_empty() {
            warn!(%location, diffs = diffs.len(), "content differs");
            return Err(Error::ContentMismatch {
                path: location.path.clone(),
                diffs,
            });
        }
        Ok(())
    }

    /// Compares every mount path of the snapshot on `host` to `expected`.
    pub async fn validate_mount(
        &self,
        job_id: JobId,
        copy_id: CopyId,
        host: &str,
        expected: &ContentDigest,
    ) -> Result<Vec<PathBuf>> {
        let volume_ids = self.backends.metadata.volume_ids(job_id, copy_id).await?;
        let mount_paths = self.backends.metadata.mount_paths(job_id, copy_id).await?;
        let snapshot = Snapshot::new(job_id, copy_id, volume_ids, mount_paths);
        if snapshot.mount_paths.is_empty() {
            return Err(Error::InvalidTransition {
                op: ArrayOpKind::Mount,
                job_id,
                copy_id,
                state: snapshot.observed_state(),
            });
        }
        for path in &snapshot.mount_paths {
            self.compare(&ContentLocation::new(host, path.clone()), expected)
                .await?;
        }
        info!(%job_id, %copy_id, host, paths = snapshot.mount_paths.len(), "mounted content matches");
        Ok(snapshot.mount_paths)
    }

    /// None of `paths` may exist on `host` after an unmount.
    pub async fn validate_unmount(&self, host: &str, paths: &[PathBuf]) -> Result<()> {
        let mut leaked = Vec::new();
        for path in paths {
            let location = ContentLocation::new(host, path.clone());
            if self.backends.mount_host.exists(&location).await? {
                leaked.push(path.clone());
            }
        }
        if !leaked.is_empty() {
            return Err(Error::MountLeak {
                host: host.to_string(),
                paths: leaked,
            });
        }
        Ok(())
    }

    async fn gone_probe(&self, job_id: JobId, copy_id: CopyId) -> Result<Option<()>> {
        let volume_ids = self.backends.metadata.volume_ids(job_id, copy_id).await?;
        Ok(volume_ids.iter().all(|v| v.is_blank()).then_some(()))
    }

    /// Waits on the long delete schedule for the snapshot's volume to
    /// disappear.
    pub async fn validate_delete(
        &self,
        job_id: JobId,
        copy_id: CopyId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let outcome = poll_until(&self.timings.delete_poll(), cancel, |_| {
            self.gone_probe(job_id, copy_id)
        })
        .await?;
        match outcome {
            PollOutcome::Ready { .. } => Ok(()),
            PollOutcome::Cancelled { .. } => Err(Error::cancelled(format!(
                "validating delete of job {} on copy {}",
                job_id, copy_id
            ))),
            PollOutcome::Exhausted { attempts } => Err(Error::PostConditionTimeout {
                op: ArrayOpKind::Delete,
                job_id,
                copy_id,
                attempts,
            }),
        }
    }

    pub async fn validate_revert(
        &self,
        location: &ContentLocation,
        expected: &ContentDigest,
    ) -> Result<()> {
        self.compare(location, expected).await?;
        info!(%location, "reverted content matches");
        Ok(())
    }

    /// Sets the retention the copy's role calls for, runs aging and checks
    /// that exactly the expected jobs were pruned from `copy_name`.
    ///
    /// Snap copies are spooled and lose every job. Vaults keep one cycle.
    /// Mirrors are aged through their source copy by default, spooled unless
    /// the layout keeps a cycle on the source. The aged copy is left with a
    /// single-cycle retention afterwards.
    pub async fn validate_topology_aging(
        &self,
        ctx: &mut ScenarioContext,
        copy_name: &str,
        tracked_jobs: &[JobId],
    ) -> Result<AgingReport> {
        let copy = self
            .backends
            .copies
            .get_copy(&ctx.policy, copy_name)
            .await?
            .ok_or_else(|| Error::CopyNotFound {
                policy: ctx.policy.clone(),
                name: copy_name.to_string(),
            })?;
        let keep = tracked_jobs.len().saturating_sub(self.aging.jobs_per_cycle);
        let all = tracked_jobs.to_vec();
        let older = tracked_jobs[..keep].to_vec();

        let (aged_copy, retention, pruned) = if copy.kind.is_root() {
            (copy.name.clone(), Retention::spool(), all)
        } else if copy.kind.is_mirror() && self.aging.mirror_target == MirrorAgingTarget::Source {
            let source = copy.source_copy.clone().ok_or_else(|| Error::InvalidCopy {
                name: copy.name.clone(),
                reason: "mirror without a source copy".to_string(),
            })?;
            if ctx.layout.is_some_and(|l| l.mirror_source_keeps_cycle()) {
                (source, Retention::single_cycle(), older)
            } else {
                (source, Retention::spool(), all)
            }
        } else {
            (copy.name.clone(), Retention::single_cycle(), older)
        };

        info!(
            copy = copy_name,
            aged_copy = %aged_copy,
            %retention,
            expected_pruned = pruned.len(),
            "validating aging"
        );
        self.retention
            .set_retention(&ctx.policy, &aged_copy, retention)
            .await?;
        let verified = match self.retention.run_aging(ctx, &aged_copy).await {
            Ok(_) => self.retention.verify_pruned(ctx, &pruned, copy_name).await,
            Err(err) => Err(err),
        };
        self.retention
            .set_retention(&ctx.policy, &aged_copy, Retention::single_cycle())
            .await?;
        verified?;

        let retained = tracked_jobs
            .iter()
            .filter(|id| !pruned.contains(id))
            .copied()
            .collect();
        Ok(AgingReport {
            copy: copy_name.to_string(),
            aged_copy,
            retention,
            pruned,
            retained,
        })
    }
}
