use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use data_model::{
    BackupRequest,
    ContentDigest,
    ContentLocation,
    ControlHostId,
    CopyKind,
    JobId,
    MountSpec,
    Retention,
    ScenarioContext,
    StorageCopy,
};
use nanoid::nanoid;
use processor::{AgingReport, ReconcileReport, SnapEngine};
use sha2::{Digest, Sha256};
use snap_utils::{cancel_after, OptionInspectNone};
use state_store::{Backends, MountHost, SimulatedBackend};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::SnapConfig;

const SEED_FILES: [&str; 3] = ["dir1/file1.txt", "dir1/file2.txt", "file3.bin"];

/// What a rehearsal of the scenario template did.
#[derive(Debug, Clone, Default)]
pub struct ScenarioSummary {
    pub name: String,
    pub jobs: Vec<JobId>,
    pub copies: Vec<String>,
    /// Copy name to the paths its snapshot was mounted at.
    pub mounted: Vec<(String, Vec<PathBuf>)>,
    pub reverted: Option<JobId>,
    pub deleted: Vec<(JobId, String)>,
    pub aging: Vec<AgingReport>,
    pub reconciled: ReconcileReport,
    pub cleaned_up: Vec<String>,
}

/// Runs the scenario template against a simulated array estate.
pub struct Service {
    pub config: SnapConfig,
    pub backend: Arc<SimulatedBackend>,
    pub engine: SnapEngine,
    pub metrics: Arc<metrics::Metrics>,
    expected_content: ContentDigest,
}

impl Service {
    pub async fn new(config: SnapConfig) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(SimulatedBackend::new(config.simulation.clone()));
        for (idx, array) in config.arrays.iter().enumerate() {
            backend
                .register_array(array, ControlHostId::new(idx as u64 + 1))
                .await;
        }
        let expected_content = seed_content();
        backend
            .set_protected_content(content_location(&config), expected_content.clone())
            .await;

        let metrics = Arc::new(metrics::Metrics::new());
        let engine = SnapEngine::new(
            Backends::simulated(backend.clone()),
            &config.policy_name,
            config.timings.clone(),
            config.aging.clone(),
            metrics.clone(),
        );
        Ok(Self {
            config,
            backend,
            engine,
            metrics,
            expected_content,
        })
    }

    /// Runs the template under `cancel`, bounded by the configured scenario
    /// deadline.
    pub async fn run(&self, name: &str, cancel: CancellationToken) -> Result<ScenarioSummary> {
        let deadline = self
            .config
            .timings
            .scenario_deadline()
            .map(|after| cancel_after(&cancel, after));
        let ctx = ScenarioContext::new(name, &self.config.policy_name, &self.config.primary_copy)
            .with_cancellation(cancel);
        let span = info_span!("scenario", scenario = name, policy = %self.config.policy_name);
        let result = self.run_template(ctx).instrument(span).await;
        if let Some(deadline) = deadline {
            deadline.abort();
        }
        result
    }

    async fn run_template(&self, mut ctx: ScenarioContext) -> Result<ScenarioSummary> {
        let mut summary = ScenarioSummary {
            name: ctx.name.clone(),
            ..Default::default()
        };
        let primary = self
            .build_topology(&mut ctx)
            .await
            .context("building copy topology")?;
        summary.copies = std::iter::once(primary.name.clone())
            .chain(ctx.secondary_copies().iter().cloned())
            .collect();

        for _ in 0..self.config.backups {
            let request = BackupRequest {
                skip_catalog: self.config.skip_catalog,
                inline_backup_copy: self.config.inline_backup_copy,
                ..Default::default()
            };
            let job = self
                .engine
                .runner
                .run_backup(&mut ctx, request, self.config.suspend_jobs)
                .await?;
            summary.jobs.push(job.id);
        }
        if !ctx.secondary_copies().is_empty() {
            self.engine
                .runner
                .run_aux_copy(&ctx, None, self.config.suspend_jobs)
                .await?;
        }
        let latest = *summary
            .jobs
            .last()
            .ok_or_else(|| anyhow!("scenario ran no backups"))?;

        for name in &summary.copies {
            let copy = self.engine.topology.get_copy(name).await?;
            let paths = self.mount_roundtrip(&mut ctx, latest, &copy).await?;
            summary.mounted.push((copy.name.clone(), paths));
        }

        self.revert_primary(&ctx, latest, &primary).await?;
        summary.reverted = Some(latest);

        if summary.jobs.len() > 1 {
            let oldest = summary.jobs[0];
            self.delete_snapshot(&ctx, oldest, &primary).await?;
            summary.deleted.push((oldest, primary.name.clone()));
        }

        summary.reconciled = self
            .engine
            .lifecycle
            .reconcile_job(latest, ctx.cancel_token())
            .await?;

        // secondaries before the primary, spooling the primary empties it
        let tracked = ctx.job_tracker.clone();
        let aging_order = summary
            .copies
            .iter()
            .skip(1)
            .chain(summary.copies.first())
            .cloned()
            .collect::<Vec<_>>();
        for name in aging_order {
            let report = self
                .engine
                .validation
                .validate_topology_aging(&mut ctx, &name, &tracked)
                .await?;
            summary.aging.push(report);
        }

        summary.cleaned_up = self.engine.topology.cleanup().await?;
        info!(
            jobs = summary.jobs.len(),
            copies = summary.copies.len(),
            "scenario finished"
        );
        Ok(summary)
    }

    async fn build_topology(&self, ctx: &mut ScenarioContext) -> Result<StorageCopy> {
        let topology = &self.engine.topology;
        let primary = topology
            .create_copy(
                &self.config.primary_copy,
                CopyKind::Snap,
                None,
                &self.config.arrays[0],
                Retention::default(),
            )
            .await?;
        if let Some(layout) = self
            .config
            .layout
            .inspect_none(|| info!("no replication layout, primary copy only"))
        {
            topology
                .build_layout(ctx, layout, &self.config.arrays, Retention::default())
                .await?;
        }
        Ok(primary)
    }

    async fn mount_roundtrip(
        &self,
        ctx: &mut ScenarioContext,
        job_id: JobId,
        copy: &StorageCopy,
    ) -> Result<Vec<PathBuf>> {
        let cancel = ctx.cancel_token().clone();
        let lifecycle = &self.engine.lifecycle;
        let validation = &self.engine.validation;
        lifecycle.wait_for_created(job_id, copy, &cancel).await?;

        let spec = MountSpec {
            host: self.config.mount_host.clone(),
            mount_path: self
                .config
                .mount_path
                .join(format!("{}_{}", copy.name, nanoid!(8))),
            vss_protection: true,
        };
        lifecycle.mount(job_id, copy.id, &spec, &cancel).await?;
        let paths = validation
            .validate_mount(job_id, copy.id, &spec.host, &self.expected_content)
            .await?;
        ctx.mount_paths = paths.clone();

        let unmounted = lifecycle.unmount(job_id, copy.id, &cancel).await?;
        if unmounted.is_noop() {
            warn!(%job_id, copy = %copy.name, "snapshot was unmounted outside the scenario");
        }
        validation.validate_unmount(&spec.host, &paths).await?;
        Ok(paths)
    }

    async fn revert_primary(
        &self,
        ctx: &ScenarioContext,
        job_id: JobId,
        primary: &StorageCopy,
    ) -> Result<()> {
        let location = content_location(&self.config);
        self.backend.clear(&location).await?;
        self.engine
            .lifecycle
            .revert(job_id, primary.id, &[location.clone()], ctx.cancel_token())
            .await?;
        self.engine
            .validation
            .validate_revert(&location, &self.expected_content)
            .await?;
        Ok(())
    }

    async fn delete_snapshot(
        &self,
        ctx: &ScenarioContext,
        job_id: JobId,
        copy: &StorageCopy,
    ) -> Result<()> {
        let outcome = self
            .engine
            .lifecycle
            .delete(job_id, copy.id, ctx.cancel_token())
            .await?;
        if !outcome.confirmed {
            self.engine
                .validation
                .validate_delete(job_id, copy.id, ctx.cancel_token())
                .await?;
        }
        Ok(())
    }
}

fn content_location(config: &SnapConfig) -> ContentLocation {
    ContentLocation::new(config.mount_host.clone(), config.content_path.clone())
}

fn seed_content() -> ContentDigest {
    SEED_FILES
        .iter()
        .map(|path| {
            let hash = hex::encode(Sha256::digest(nanoid!().as_bytes()));
            (path.to_string(), hash)
        })
        .collect()
}
