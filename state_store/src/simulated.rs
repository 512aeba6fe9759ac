//! In-memory array and job backend.
//!
//! Jobs follow a [`JobScript`]: an ordered list of phases, each lasting a
//! fixed amount of (tokio) time, and a final status. Progress is derived from
//! the clock whenever the backend is touched, so tests running on a paused
//! runtime see jobs advance exactly as far as the orchestrator slept.
//! Completed jobs apply their side effects once: backups create snapshots on
//! the snap copies, aux copies propagate them down the copy graph, data aging
//! prunes by retention and array operations mount, unmount, revert or delete.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    path::PathBuf,
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{
    backup_copy_phases,
    ArrayOperation,
    ContentDigest,
    ContentLocation,
    ControlHostId,
    CopyId,
    JobHandle,
    JobId,
    JobKind,
    JobRequest,
    JobStatus,
    JobStatusReport,
    PhaseOrder,
    Retention,
    StorageCopy,
    VolumeId,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info};

use crate::{ArrayOperationClient, CopyPersistence, JobController, MetadataStore, MountHost};

const FIRST_JOB_ID: u64 = 1000;
const FAILED_TO_START: &str = "Job failed to start";

/// Phases a job walks through and the status it ends in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobScript {
    pub phases: Vec<(String, Duration)>,
    pub outcome: JobStatus,
    pub delay_reason: Option<String>,
}

impl JobScript {
    pub fn new<S: Into<String>>(
        phases: impl IntoIterator<Item = (S, Duration)>,
        outcome: JobStatus,
    ) -> Self {
        Self {
            phases: phases.into_iter().map(|(p, d)| (p.into(), d)).collect(),
            outcome,
            delay_reason: None,
        }
    }

    /// Every phase of `order` lasting `dwell`, then `Completed`.
    pub fn completing(order: &PhaseOrder, dwell: Duration) -> Self {
        Self::new(
            order.phases().iter().map(|p| (p.clone(), dwell)),
            JobStatus::Completed,
        )
    }

    pub fn with_delay_reason(mut self, reason: impl Into<String>) -> Self {
        self.delay_reason = Some(reason.into());
        self
    }

    fn total(&self) -> Duration {
        self.phases.iter().map(|(_, d)| *d).sum()
    }

    fn phase_at(&self, elapsed: Duration) -> &str {
        let mut end = Duration::ZERO;
        for (phase, dwell) in &self.phases {
            end += *dwell;
            if elapsed < end {
                return phase;
            }
        }
        self.phases.last().map(|(p, _)| p.as_str()).unwrap_or("")
    }
}

/// Timings and shape of the simulated backend, all durations in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimSettings {
    pub phase_secs: u64,
    pub aux_copy_secs: u64,
    pub aging_secs: u64,
    pub array_op_secs: u64,
    /// Delay before a new snapshot shows up in the metadata store.
    pub visibility_lag_secs: u64,
    /// Delay before a pruned or deleted snapshot disappears.
    pub prune_lag_secs: u64,
    /// Delay before a pause request takes effect.
    pub pause_delay_secs: u64,
    /// Jobs one retained cycle keeps.
    pub jobs_per_cycle: usize,
    pub volumes_per_snapshot: usize,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            phase_secs: 60,
            aux_copy_secs: 120,
            aging_secs: 30,
            array_op_secs: 30,
            visibility_lag_secs: 0,
            prune_lag_secs: 0,
            pause_delay_secs: 0,
            jobs_per_cycle: 2,
            volumes_per_snapshot: 1,
        }
    }
}

#[derive(Debug, Clone)]
enum Payload {
    Request(JobRequest),
    Array(ArrayOperation),
}

#[derive(Debug)]
struct SimJob {
    handle: JobHandle,
    payload: Payload,
    script: JobScript,
    progressed: Duration,
    running_since: Option<Instant>,
    held: Option<JobStatus>,
    pause_at: Option<Instant>,
    terminal: Option<JobStatus>,
}

impl SimJob {
    fn elapsed(&self, now: Instant) -> Duration {
        self.progressed +
            self.running_since
                .map(|since| now.saturating_duration_since(since))
                .unwrap_or_default()
    }

    fn freeze(&mut self, at: Instant) {
        if let Some(since) = self.running_since.take() {
            self.progressed += at.saturating_duration_since(since);
        }
    }

    /// Returns the terminal status when the job finished during this call.
    fn advance(&mut self, now: Instant) -> Option<JobStatus> {
        if self.terminal.is_some() {
            return None;
        }
        if let Some(at) = self.pause_at {
            if now >= at {
                self.freeze(at);
                self.pause_at = None;
                self.held = Some(JobStatus::Suspended);
            }
        }
        if self.elapsed(now) >= self.script.total() {
            self.freeze(now);
            self.held = None;
            self.terminal = Some(self.script.outcome);
            return self.terminal;
        }
        None
    }

    fn report(&self, now: Instant) -> JobStatusReport {
        let status = self
            .terminal
            .or(self.held)
            .unwrap_or(JobStatus::Running);
        let mut report = JobStatusReport::new(self.script.phase_at(self.elapsed(now)), status);
        if let Some(reason) = &self.script.delay_reason {
            report = report.with_delay_reason(reason.clone());
        }
        report
    }
}

#[derive(Debug, Clone)]
struct SimSnapshot {
    array_name: String,
    volume_ids: Vec<VolumeId>,
    mount_paths: Vec<PathBuf>,
    mounted_on: Option<String>,
    content: ContentDigest,
    visible_at: Instant,
    removed_at: Option<Instant>,
}

impl SimSnapshot {
    fn removed(&self, now: Instant) -> bool {
        self.removed_at.is_some_and(|at| now >= at)
    }

    fn visible(&self, now: Instant) -> bool {
        now >= self.visible_at && !self.removed(now)
    }
}

#[derive(Debug, Default)]
struct SimState {
    settings: SimSettings,
    next_job_id: u64,
    next_copy_id: u64,
    jobs: BTreeMap<JobId, SimJob>,
    copies: Vec<StorageCopy>,
    snapshots: BTreeMap<(JobId, CopyId), SimSnapshot>,
    arrays: BTreeMap<String, ControlHostId>,
    files: BTreeMap<ContentLocation, ContentDigest>,
    content_source: Option<ContentLocation>,
    backup_copies: BTreeMap<JobId, JobId>,
    scripted: HashMap<JobKind, VecDeque<JobScript>>,
    failing_aging_starts: u32,
    pending_resumes: u32,
    stuck: BTreeSet<JobId>,
    failing_control_hosts: BTreeSet<ControlHostId>,
    array_calls: Vec<ArrayOperation>,
}

impl SimState {
    fn secs(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    fn tick(&mut self, now: Instant) {
        let finished = self
            .jobs
            .iter_mut()
            .filter_map(|(id, job)| job.advance(now).map(|status| (*id, status)))
            .collect::<Vec<_>>();
        for (id, status) in finished {
            debug!(job_id = %id, %status, "simulated job finished");
            if status == JobStatus::Completed {
                self.apply_completion(id, now);
            }
        }
    }

    fn job_mut(&mut self, job: &JobHandle) -> Result<&mut SimJob> {
        self.jobs
            .get_mut(&job.id)
            .ok_or(anyhow!("unknown job {}", job.id))
    }

    fn default_script(&self, payload: &Payload) -> JobScript {
        let s = &self.settings;
        match payload {
            Payload::Request(JobRequest::Backup(request)) => {
                JobScript::completing(&request.phases(), Self::secs(s.phase_secs))
            }
            Payload::Request(JobRequest::AuxCopy { .. }) => JobScript::new(
                [
                    ("scan", Self::secs(s.phase_secs)),
                    ("auxiliary copy", Self::secs(s.aux_copy_secs)),
                ],
                JobStatus::Completed,
            ),
            Payload::Request(JobRequest::BackupCopy { .. }) => {
                JobScript::completing(&backup_copy_phases(), Self::secs(s.phase_secs))
            }
            Payload::Request(JobRequest::DataAging { .. }) => JobScript::new(
                [("data aging", Self::secs(s.aging_secs))],
                JobStatus::Completed,
            ),
            Payload::Array(ArrayOperation::Reconcile { control_host })
                if self.failing_control_hosts.contains(control_host) =>
            {
                JobScript::new(
                    [("reconcile", Self::secs(s.array_op_secs))],
                    JobStatus::Failed,
                )
                .with_delay_reason(format!("reconcile failed on control host {}", control_host))
            }
            Payload::Array(op) if !op.volume_ids().is_empty() && self.find_by_volumes(op).is_none() => {
                JobScript::new(
                    [("snap operation", Self::secs(s.array_op_secs))],
                    JobStatus::Failed,
                )
                .with_delay_reason("volume not found on array")
            }
            Payload::Array(_) => JobScript::new(
                [("snap operation", Self::secs(s.array_op_secs))],
                JobStatus::Completed,
            ),
        }
    }

    fn spawn_job(&mut self, kind: JobKind, payload: Payload, now: Instant) -> JobHandle {
        let id = JobId::new(FIRST_JOB_ID + self.next_job_id);
        self.next_job_id += 1;

        let failed_start = kind == JobKind::DataAging && self.failing_aging_starts > 0;
        let script = if failed_start {
            self.failing_aging_starts -= 1;
            JobScript::new(Vec::<(String, Duration)>::new(), JobStatus::FailedToStart)
                .with_delay_reason(FAILED_TO_START)
        } else if let Some(script) = self.scripted.get_mut(&kind).and_then(|q| q.pop_front()) {
            script
        } else {
            self.default_script(&payload)
        };

        let handle = JobHandle::new(id, kind);
        let mut job = SimJob {
            handle,
            payload,
            script,
            progressed: Duration::ZERO,
            running_since: Some(now),
            held: None,
            pause_at: None,
            terminal: None,
        };
        if failed_start {
            job.running_since = None;
            job.terminal = Some(JobStatus::FailedToStart);
        }
        self.jobs.insert(id, job);
        debug!(job = %handle, "simulated job submitted");
        handle
    }

    fn find_by_volumes(&self, op: &ArrayOperation) -> Option<(JobId, CopyId)> {
        let volumes = op.volume_ids();
        self.snapshots
            .iter()
            .find(|(_, snap)| snap.removed_at.is_none() && snap.volume_ids == volumes)
            .map(|(key, _)| *key)
    }

    fn new_snapshot(&self, job_id: JobId, copy: &StorageCopy, content: ContentDigest, now: Instant) -> SimSnapshot {
        let volume_ids = (0..self.settings.volumes_per_snapshot.max(1))
            .map(|i| VolumeId::new(format!("vol-{}-{}-{}", job_id, copy.id, i)))
            .collect();
        SimSnapshot {
            array_name: copy.array_name.clone(),
            volume_ids,
            mount_paths: Vec::new(),
            mounted_on: None,
            content,
            visible_at: now + Self::secs(self.settings.visibility_lag_secs),
            removed_at: None,
        }
    }

    fn apply_completion(&mut self, id: JobId, now: Instant) {
        let Some(payload) = self.jobs.get(&id).map(|job| job.payload.clone()) else {
            return;
        };
        match payload {
            Payload::Request(JobRequest::Backup(request)) => {
                let content = self
                    .content_source
                    .as_ref()
                    .and_then(|src| self.files.get(src).cloned())
                    .unwrap_or_default();
                let roots = self
                    .copies
                    .iter()
                    .filter(|c| c.kind.is_root())
                    .cloned()
                    .collect::<Vec<_>>();
                for copy in roots {
                    let snapshot = self.new_snapshot(id, &copy, content.clone(), now);
                    self.snapshots.insert((id, copy.id), snapshot);
                }
                if request.inline_backup_copy {
                    let policy = self
                        .copies
                        .first()
                        .map(|c| c.policy.clone())
                        .unwrap_or_default();
                    let child = self.spawn_job(
                        JobKind::BackupCopy,
                        Payload::Request(JobRequest::BackupCopy { policy }),
                        now,
                    );
                    self.backup_copies.insert(id, child.id);
                }
            }
            Payload::Request(JobRequest::AuxCopy {
                policy, copy_name, ..
            }) => self.aux_copy(&policy, copy_name.as_deref(), now),
            Payload::Request(JobRequest::DataAging { policy, copy_name }) => {
                self.prune(&policy, &copy_name, now)
            }
            Payload::Request(JobRequest::BackupCopy { .. }) => {}
            Payload::Array(op) => self.apply_array_op(op, now),
        }
    }

    fn aux_copy(&mut self, policy: &str, copy_name: Option<&str>, now: Instant) {
        let targets = self
            .copies
            .iter()
            .filter(|c| c.policy == policy && !c.is_root())
            .filter(|c| copy_name.is_none_or(|name| c.name == name))
            .cloned()
            .collect::<Vec<_>>();
        // creation order is topological, so chains fill in a single pass
        for target in targets {
            let Some(source) = self
                .copies
                .iter()
                .find(|c| c.policy == policy && Some(&c.name) == target.source_copy.as_ref())
                .cloned()
            else {
                continue;
            };
            let pending = self
                .snapshots
                .iter()
                .filter(|((_, copy_id), snap)| *copy_id == source.id && snap.removed_at.is_none())
                .map(|((job_id, _), snap)| (*job_id, snap.content.clone()))
                .filter(|(job_id, _)| !self.snapshots.contains_key(&(*job_id, target.id)))
                .collect::<Vec<_>>();
            for (job_id, content) in pending {
                let snapshot = self.new_snapshot(job_id, &target, content, now);
                self.snapshots.insert((job_id, target.id), snapshot);
            }
        }
    }

    fn mark_removed(&mut self, key: (JobId, CopyId), now: Instant) {
        if self.stuck.contains(&key.0) {
            debug!(job_id = %key.0, copy_id = %key.1, "snapshot is stuck, not removing");
            return;
        }
        let at = now + Self::secs(self.settings.prune_lag_secs);
        if let Some(snap) = self.snapshots.get_mut(&key) {
            snap.removed_at.get_or_insert(at);
        }
    }

    fn prune(&mut self, policy: &str, copy_name: &str, now: Instant) {
        let Some(copy) = self
            .copies
            .iter()
            .find(|c| c.policy == policy && c.name == copy_name)
            .cloned()
        else {
            return;
        };
        let jobs = self
            .snapshots
            .iter()
            .filter(|((_, copy_id), snap)| *copy_id == copy.id && snap.removed_at.is_none())
            .map(|((job_id, _), _)| *job_id)
            .sorted()
            .collect::<Vec<_>>();
        let retention = copy.retention;
        let keep = if retention.days > 0 {
            jobs.len()
        } else {
            (retention.cycles + retention.extended_cycles) as usize * self.settings.jobs_per_cycle
        };
        let pruned = jobs[..jobs.len().saturating_sub(keep)].to_vec();
        info!(copy = copy_name, %retention, pruned = pruned.len(), "simulated data aging");

        // mirrors inherit prune eligibility from their source
        let mut targets = vec![copy.clone()];
        let mut idx = 0;
        while idx < targets.len() {
            let parent = targets[idx].name.clone();
            targets.extend(
                self.copies
                    .iter()
                    .filter(|c| {
                        c.policy == policy &&
                            c.kind.is_mirror() &&
                            c.source_copy.as_deref() == Some(parent.as_str())
                    })
                    .cloned(),
            );
            idx += 1;
        }
        for target in targets {
            for job_id in &pruned {
                self.mark_removed((*job_id, target.id), now);
            }
        }
    }

    fn apply_array_op(&mut self, op: ArrayOperation, now: Instant) {
        let Some(key) = self.find_by_volumes(&op) else {
            return;
        };
        match op {
            ArrayOperation::Mount { spec, .. } => {
                if let Some(snap) = self.snapshots.get_mut(&key) {
                    snap.mount_paths = vec![spec.mount_path.clone()];
                    snap.mounted_on = Some(spec.host.clone());
                    let content = snap.content.clone();
                    self.files.insert(spec.location(), content);
                }
            }
            ArrayOperation::Unmount { .. } | ArrayOperation::ForceUnmount { .. } => {
                self.unmount(key);
            }
            ArrayOperation::Revert { .. } => {
                let content = self.snapshots.get(&key).map(|s| s.content.clone());
                if let (Some(src), Some(content)) = (self.content_source.clone(), content) {
                    self.files.insert(src, content);
                }
            }
            ArrayOperation::Delete { .. } | ArrayOperation::ForceDelete { .. } => {
                self.mark_removed(key, now);
            }
            ArrayOperation::Reconcile { .. } => {}
        }
    }

    fn unmount(&mut self, key: (JobId, CopyId)) {
        if let Some(snap) = self.snapshots.get_mut(&key) {
            let host = snap.mounted_on.take().unwrap_or_default();
            for path in snap.mount_paths.drain(..) {
                self.files.remove(&ContentLocation::new(host.clone(), path));
            }
        }
    }
}

/// Scripted, clock-driven stand-in for the metadata store, job scheduler,
/// array endpoint, copy persistence and mount hosts.
#[derive(Debug)]
pub struct SimulatedBackend {
    state: Mutex<SimState>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(SimSettings::default())
    }
}

impl SimulatedBackend {
    pub fn new(settings: SimSettings) -> Self {
        Self {
            state: Mutex::new(SimState {
                settings,
                next_copy_id: 1,
                ..Default::default()
            }),
        }
    }

    pub async fn register_array(&self, array_name: &str, control_host: ControlHostId) {
        let mut state = self.state.lock().await;
        state.arrays.insert(array_name.to_string(), control_host);
    }

    /// Places `content` at `location`. Backups capture it and reverts
    /// restore it.
    pub async fn set_protected_content(&self, location: ContentLocation, content: ContentDigest) {
        let mut state = self.state.lock().await;
        state.files.insert(location.clone(), content);
        state.content_source = Some(location);
    }

    /// The next job of `kind` follows `script` instead of the default one.
    pub async fn script_next(&self, kind: JobKind, script: JobScript) {
        let mut state = self.state.lock().await;
        state.scripted.entry(kind).or_default().push_back(script);
    }

    pub async fn fail_aging_starts(&self, count: u32) {
        self.state.lock().await.failing_aging_starts = count;
    }

    /// The next `count` resumes leave the job pending.
    pub async fn pending_on_resume(&self, count: u32) {
        self.state.lock().await.pending_resumes = count;
    }

    /// Snapshots of `job_id` survive aging and deletes.
    pub async fn stick_snapshots(&self, job_id: JobId) {
        self.state.lock().await.stuck.insert(job_id);
    }

    pub async fn fail_reconcile_on(&self, control_host: ControlHostId) {
        self.state
            .lock()
            .await
            .failing_control_hosts
            .insert(control_host);
    }

    /// Unmounts a snapshot behind the orchestrator's back, as an operator
    /// would.
    pub async fn external_unmount(&self, job_id: JobId, copy_id: CopyId) {
        self.state.lock().await.unmount((job_id, copy_id));
    }

    pub async fn array_calls(&self) -> Vec<ArrayOperation> {
        self.state.lock().await.array_calls.clone()
    }

    pub async fn job_ids(&self) -> Vec<JobId> {
        self.state.lock().await.jobs.keys().copied().collect()
    }
}

#[async_trait]
impl JobController for SimulatedBackend {
    async fn submit(&self, request: JobRequest) -> Result<JobHandle> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.tick(now);
        let kind = request.kind();
        Ok(state.spawn_job(kind, Payload::Request(request), now))
    }

    async fn status(&self, job: &JobHandle) -> Result<JobStatusReport> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.tick(now);
        Ok(state.job_mut(job)?.report(now))
    }

    async fn pause(&self, job: &JobHandle) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.tick(now);
        let delay = SimState::secs(state.settings.pause_delay_secs);
        let sim_job = state.job_mut(job)?;
        if sim_job.terminal.is_some() || sim_job.held.is_some() {
            return Ok(());
        }
        sim_job.pause_at = Some(now + delay);
        state.tick(now);
        Ok(())
    }

    async fn resume(&self, job: &JobHandle) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.tick(now);
        let leave_pending = state.pending_resumes > 0;
        let sim_job = state.job_mut(job)?;
        if sim_job.terminal.is_some() {
            return Ok(());
        }
        sim_job.pause_at = None;
        let held = sim_job.held;
        let parked = matches!(held, Some(JobStatus::Suspended | JobStatus::Pending)) && leave_pending;
        if parked {
            sim_job.held = Some(JobStatus::Pending);
        } else if held.is_some() {
            sim_job.held = None;
            sim_job.running_since = Some(now);
        }
        if parked {
            state.pending_resumes -= 1;
        }
        Ok(())
    }

    async fn kill(&self, job: &JobHandle) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.tick(now);
        let sim_job = state.job_mut(job)?;
        if sim_job.terminal.is_none() {
            sim_job.freeze(now);
            sim_job.held = None;
            sim_job.pause_at = None;
            sim_job.terminal = Some(JobStatus::Killed);
        }
        Ok(())
    }
}

#[async_trait]
impl ArrayOperationClient for SimulatedBackend {
    async fn execute(&self, op: ArrayOperation) -> Result<JobHandle> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.tick(now);
        state.array_calls.push(op.clone());
        let kind = match op {
            ArrayOperation::Reconcile { .. } => JobKind::Reconcile,
            _ => JobKind::ArrayOp,
        };
        Ok(state.spawn_job(kind, Payload::Array(op), now))
    }
}

#[async_trait]
impl CopyPersistence for SimulatedBackend {
    async fn get_copy(&self, policy: &str, name: &str) -> Result<Option<StorageCopy>> {
        let state = self.state.lock().await;
        Ok(state
            .copies
            .iter()
            .find(|c| c.policy == policy && c.name == name)
            .cloned())
    }

    async fn create_copy(&self, mut copy: StorageCopy) -> Result<StorageCopy> {
        let mut state = self.state.lock().await;
        if state.copies.iter().any(|c| c.key() == copy.key()) {
            return Err(anyhow!("copy {} already exists", copy.key()));
        }
        copy.id = CopyId::new(state.next_copy_id);
        state.next_copy_id += 1;
        state.copies.push(copy.clone());
        Ok(copy)
    }

    async fn delete_copy(&self, policy: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let idx = state
            .copies
            .iter()
            .position(|c| c.policy == policy && c.name == name)
            .ok_or(anyhow!("copy {} not found", StorageCopy::key_from(policy, name)))?;
        let copy = state.copies.remove(idx);
        state.snapshots.retain(|(_, copy_id), _| *copy_id != copy.id);
        Ok(())
    }

    async fn update_retention(&self, policy: &str, name: &str, retention: Retention) -> Result<()> {
        let mut state = self.state.lock().await;
        let copy = state
            .copies
            .iter_mut()
            .find(|c| c.policy == policy && c.name == name)
            .ok_or(anyhow!("copy {} not found", StorageCopy::key_from(policy, name)))?;
        copy.retention = retention;
        Ok(())
    }

    async fn list_copies(&self, policy: &str) -> Result<Vec<StorageCopy>> {
        let state = self.state.lock().await;
        Ok(state
            .copies
            .iter()
            .filter(|c| c.policy == policy)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MetadataStore for SimulatedBackend {
    async fn volume_ids(&self, job_id: JobId, copy_id: CopyId) -> Result<Vec<VolumeId>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.tick(now);
        Ok(state
            .snapshots
            .get(&(job_id, copy_id))
            .filter(|snap| snap.visible(now))
            .map(|snap| snap.volume_ids.clone())
            .unwrap_or_default())
    }

    async fn mount_paths(&self, job_id: JobId, copy_id: CopyId) -> Result<Vec<PathBuf>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.tick(now);
        Ok(state
            .snapshots
            .get(&(job_id, copy_id))
            .filter(|snap| snap.visible(now))
            .map(|snap| snap.mount_paths.clone())
            .unwrap_or_default())
    }

    async fn control_host_id(&self, array_name: &str) -> Result<ControlHostId> {
        let state = self.state.lock().await;
        state
            .arrays
            .get(array_name)
            .copied()
            .ok_or(anyhow!("array {} is not registered", array_name))
    }

    async fn arrays_for_job(&self, job_id: JobId) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.tick(now);
        Ok(state
            .snapshots
            .iter()
            .filter(|((id, _), snap)| *id == job_id && !snap.removed(now))
            .map(|(_, snap)| snap.array_name.clone())
            .sorted()
            .dedup()
            .collect())
    }

    async fn backup_copy_job(&self, job_id: JobId) -> Result<Option<JobId>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.tick(now);
        Ok(state.backup_copies.get(&job_id).copied())
    }
}

#[async_trait]
impl MountHost for SimulatedBackend {
    async fn exists(&self, location: &ContentLocation) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.files.contains_key(location))
    }

    async fn is_cleared(&self, location: &ContentLocation) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.files.get(location).is_none_or(|d| d.is_empty()))
    }

    async fn digest(&self, location: &ContentLocation) -> Result<ContentDigest> {
        let state = self.state.lock().await;
        state
            .files
            .get(location)
            .cloned()
            .ok_or(anyhow!("{} does not exist", location))
    }

    async fn clear(&self, location: &ContentLocation) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(content) = state.files.get_mut(location) {
            *content = ContentDigest::new();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use data_model::{
        test_objects::tests::{
            mock_backup_request,
            mock_content,
            mock_content_location,
            mock_copy,
            mock_mount_spec,
            TEST_POLICY,
        },
        ArrayOperation,
        ControlHostId,
        CopyKind,
        JobKind,
        JobRequest,
        JobStatus,
        ReplicaMode,
        Retention,
    };

    use super::{JobScript, SimSettings, SimulatedBackend};
    use crate::{ArrayOperationClient, CopyPersistence, JobController, MetadataStore, MountHost};

    async fn backend_with_chain() -> SimulatedBackend {
        let backend = SimulatedBackend::default();
        backend
            .create_copy(mock_copy("Snap1", CopyKind::Snap, None))
            .await
            .unwrap();
        backend
            .create_copy(mock_copy("Vault1", CopyKind::Vault, Some("Snap1")))
            .await
            .unwrap();
        backend
            .create_copy(mock_copy(
                "Mirror1",
                CopyKind::Replica(ReplicaMode::Mirror),
                Some("Vault1"),
            ))
            .await
            .unwrap();
        backend
            .set_protected_content(mock_content_location(), mock_content())
            .await;
        backend
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_walks_phases_and_creates_snapshot() {
        let backend = backend_with_chain().await;
        let job = backend
            .submit(JobRequest::Backup(mock_backup_request()))
            .await
            .unwrap();

        let report = backend.status(&job).await.unwrap();
        assert_eq!(report.status, JobStatus::Running);
        assert!(report.phase_is("backup"));

        tokio::time::sleep(Duration::from_secs(130)).await;
        assert!(backend.status(&job).await.unwrap().phase_is("catalog"));

        tokio::time::sleep(Duration::from_secs(120)).await;
        let report = backend.status(&job).await.unwrap();
        assert_eq!(report.status, JobStatus::Completed);

        let snap1 = backend.get_copy(TEST_POLICY, "Snap1").await.unwrap().unwrap();
        let vault1 = backend.get_copy(TEST_POLICY, "Vault1").await.unwrap().unwrap();
        assert_eq!(backend.volume_ids(job.id, snap1.id).await.unwrap().len(), 1);
        assert!(backend.volume_ids(job.id, vault1.id).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_freezes_progress_and_pending_resume() {
        let backend = backend_with_chain().await;
        backend.pending_on_resume(1).await;
        let job = backend
            .submit(JobRequest::Backup(mock_backup_request()))
            .await
            .unwrap();

        backend.pause(&job).await.unwrap();
        assert_eq!(backend.status(&job).await.unwrap().status, JobStatus::Suspended);
        tokio::time::sleep(Duration::from_secs(600)).await;
        let report = backend.status(&job).await.unwrap();
        assert_eq!(report.status, JobStatus::Suspended);
        assert!(report.phase_is("backup"));

        backend.resume(&job).await.unwrap();
        assert_eq!(backend.status(&job).await.unwrap().status, JobStatus::Pending);
        backend.resume(&job).await.unwrap();
        assert_eq!(backend.status(&job).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aux_copy_and_aging_cascade_to_mirror() {
        let backend = backend_with_chain().await;
        let mut jobs = Vec::new();
        for _ in 0..3 {
            let job = backend
                .submit(JobRequest::Backup(mock_backup_request()))
                .await
                .unwrap();
            jobs.push(job.id);
        }
        tokio::time::sleep(Duration::from_secs(300)).await;
        backend
            .submit(JobRequest::AuxCopy {
                policy: TEST_POLICY.to_string(),
                copy_name: None,
                use_scale: true,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(300)).await;

        let vault1 = backend.get_copy(TEST_POLICY, "Vault1").await.unwrap().unwrap();
        let mirror1 = backend.get_copy(TEST_POLICY, "Mirror1").await.unwrap().unwrap();
        for job_id in &jobs {
            assert!(!backend.volume_ids(*job_id, mirror1.id).await.unwrap().is_empty());
        }

        backend
            .update_retention(TEST_POLICY, "Vault1", Retention::single_cycle())
            .await
            .unwrap();
        backend
            .submit(JobRequest::DataAging {
                policy: TEST_POLICY.to_string(),
                copy_name: "Vault1".to_string(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(backend.volume_ids(jobs[0], vault1.id).await.unwrap().is_empty());
        assert!(backend.volume_ids(jobs[0], mirror1.id).await.unwrap().is_empty());
        assert!(!backend.volume_ids(jobs[1], vault1.id).await.unwrap().is_empty());
        assert!(!backend.volume_ids(jobs[2], mirror1.id).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_array_operations_apply_side_effects() {
        let backend = SimulatedBackend::new(SimSettings {
            prune_lag_secs: 120,
            ..Default::default()
        });
        backend
            .create_copy(mock_copy("Snap1", CopyKind::Snap, None))
            .await
            .unwrap();
        backend
            .set_protected_content(mock_content_location(), mock_content())
            .await;
        let job = backend
            .submit(JobRequest::Backup(mock_backup_request()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(300)).await;
        let snap1 = backend.get_copy(TEST_POLICY, "Snap1").await.unwrap().unwrap();
        let volume_ids = backend.volume_ids(job.id, snap1.id).await.unwrap();

        let spec = mock_mount_spec();
        backend
            .execute(ArrayOperation::Mount {
                volume_ids: volume_ids.clone(),
                spec: spec.clone(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            backend.mount_paths(job.id, snap1.id).await.unwrap(),
            vec![spec.mount_path.clone()]
        );
        assert_eq!(backend.digest(&spec.location()).await.unwrap(), mock_content());

        backend
            .execute(ArrayOperation::Delete {
                volume_ids: volume_ids.clone(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!backend.volume_ids(job.id, snap1.id).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(backend.volume_ids(job.id, snap1.id).await.unwrap().is_empty());
        assert_eq!(backend.array_calls().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_and_failing_jobs() {
        let backend = SimulatedBackend::default();
        backend.fail_aging_starts(1).await;
        backend
            .script_next(
                JobKind::Backup,
                JobScript::new([("archive index", Duration::from_secs(300))], JobStatus::Completed),
            )
            .await;
        backend.fail_reconcile_on(ControlHostId::new(7)).await;

        let aging = backend
            .submit(JobRequest::DataAging {
                policy: TEST_POLICY.to_string(),
                copy_name: "Snap1".to_string(),
            })
            .await
            .unwrap();
        let report = backend.status(&aging).await.unwrap();
        assert_eq!(report.status, JobStatus::FailedToStart);
        assert_eq!(report.reason(), "Job failed to start");

        let backup = backend
            .submit(JobRequest::Backup(mock_backup_request()))
            .await
            .unwrap();
        assert!(backend.status(&backup).await.unwrap().phase_is("archive index"));

        let reconcile = backend
            .execute(ArrayOperation::Reconcile {
                control_host: ControlHostId::new(7),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.status(&reconcile).await.unwrap().status, JobStatus::Failed);

        backend.kill(&backup).await.unwrap();
        assert_eq!(backend.status(&backup).await.unwrap().status, JobStatus::Killed);
    }
}
