pub mod layout;
pub mod scenario;
pub mod test_objects;

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    path::PathBuf,
    time::SystemTime,
};

use anyhow::{anyhow, Result};
use derive_builder::Builder;
pub use layout::{ChainLink, LayoutCopies, LayoutNode, LayoutRole, LayoutStep, ReplicationLayout};
pub use scenario::ScenarioContext;
use serde::{Deserialize, Serialize};
use snap_utils::default_creation_time;
use strum::{AsRefStr, Display as StrumDisplay, EnumString};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u64);

impl JobId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CopyId(u64);

impl CopyId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for CopyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle the array assigns to a snapshot volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VolumeId(String);

impl VolumeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The metadata store reports missing volumes as blank strings.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ControlHostId(u64);

impl ControlHostId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for ControlHostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, StrumDisplay, AsRefStr)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaMode {
    Vault,
    Mirror,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, StrumDisplay)]
#[serde(rename_all = "snake_case")]
pub enum CopyKind {
    Snap,
    Vault,
    Mirror,
    Replica(ReplicaMode),
    CloudTarget,
}

impl CopyKind {
    /// Primary snap copies are the roots of the copy graph.
    pub fn is_root(&self) -> bool {
        matches!(self, CopyKind::Snap)
    }

    pub fn is_mirror(&self) -> bool {
        matches!(
            self,
            CopyKind::Mirror | CopyKind::Replica(ReplicaMode::Mirror)
        )
    }

    pub fn is_vault(&self) -> bool {
        matches!(
            self,
            CopyKind::Vault | CopyKind::Replica(ReplicaMode::Vault) | CopyKind::CloudTarget
        )
    }
}

/// Retention attached to a copy: (days, cycles, extended cycles).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Retention {
    pub days: u32,
    pub cycles: u32,
    #[serde(default)]
    pub extended_cycles: u32,
}

impl Retention {
    pub fn new(days: u32, cycles: u32, extended_cycles: u32) -> Self {
        Self {
            days,
            cycles,
            extended_cycles,
        }
    }

    /// Nothing is retained once aging runs.
    pub fn spool() -> Self {
        Self::new(0, 0, 0)
    }

    pub fn single_cycle() -> Self {
        Self::new(0, 1, 0)
    }

    pub fn is_spool(&self) -> bool {
        self.days == 0 && self.cycles == 0 && self.extended_cycles == 0
    }
}

impl Default for Retention {
    fn default() -> Self {
        Self::new(30, 2, 0)
    }
}

impl Display for Retention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}d/{}c/{}ec",
            self.days, self.cycles, self.extended_cycles
        )
    }
}

/// A storage-policy copy. Copies form a DAG through `source_copy`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
#[builder(build_fn(skip))]
pub struct StorageCopy {
    pub id: CopyId,
    pub policy: String,
    pub name: String,
    pub kind: CopyKind,
    pub source_copy: Option<String>,
    pub retention: Retention,
    pub array_name: String,
    #[serde(default = "default_creation_time")]
    pub creation_time: SystemTime,
}

impl StorageCopy {
    pub fn key(&self) -> String {
        StorageCopy::key_from(&self.policy, &self.name)
    }

    pub fn key_from(policy: &str, name: &str) -> String {
        format!("{}|{}", policy, name)
    }

    pub fn is_root(&self) -> bool {
        self.source_copy.is_none()
    }

    /// Whether the copy was declared with the same shape. Ids and retention
    /// are not part of the shape.
    pub fn same_shape(&self, kind: CopyKind, source_copy: Option<&str>, array_name: &str) -> bool {
        self.kind == kind &&
            self.source_copy.as_deref() == source_copy &&
            self.array_name == array_name
    }
}

impl Display for StorageCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StorageCopy(name: {}, kind: {}, source: {}, array: {}, retention: {})",
            self.name,
            self.kind,
            self.source_copy.as_deref().unwrap_or("-"),
            self.array_name,
            self.retention
        )
    }
}

impl StorageCopyBuilder {
    pub fn build(&self) -> Result<StorageCopy> {
        let policy = self
            .policy
            .clone()
            .ok_or(anyhow!("storage policy is not present"))?;
        let name = self.name.clone().ok_or(anyhow!("copy name is not present"))?;
        if name.trim().is_empty() {
            return Err(anyhow!("copy name is empty"));
        }
        let kind = self.kind.ok_or(anyhow!("copy kind is not present"))?;
        let array_name = self
            .array_name
            .clone()
            .ok_or(anyhow!("array name is not present"))?;
        Ok(StorageCopy {
            // the persistence layer assigns the real id on create
            id: self.id.unwrap_or(CopyId(0)),
            policy,
            name,
            kind,
            source_copy: self.source_copy.clone().flatten(),
            retention: self.retention.unwrap_or_default(),
            array_name,
            creation_time: self.creation_time.unwrap_or_else(SystemTime::now),
        })
    }
}

/// Snapshot lifecycle states.
///
/// Only `Absent`, `Created` and `Mounted` are observable from the metadata
/// store. `Unmounted`, `Reverted` and `Deleted` label the outcome of a
/// transition and are observed as `Created`/`Absent` afterwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, StrumDisplay)]
pub enum SnapshotState {
    Absent,
    Created,
    Mounted,
    Unmounted,
    Reverted,
    Deleted,
}

impl SnapshotState {
    /// `Absent` and `Deleted` both mean there is no volume on the array.
    pub fn has_volume(&self) -> bool {
        !matches!(self, SnapshotState::Absent | SnapshotState::Deleted)
    }
}

/// A snapshot as reported by the metadata store for `(job_id, copy_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub job_id: JobId,
    pub copy_id: CopyId,
    pub volume_ids: Vec<VolumeId>,
    pub mount_paths: Vec<PathBuf>,
}

impl Snapshot {
    pub fn new(
        job_id: JobId,
        copy_id: CopyId,
        volume_ids: Vec<VolumeId>,
        mount_paths: Vec<PathBuf>,
    ) -> Self {
        let volume_ids = volume_ids.into_iter().filter(|v| !v.is_blank()).collect();
        Self {
            job_id,
            copy_id,
            volume_ids,
            mount_paths,
        }
    }

    pub fn has_volume(&self) -> bool {
        !self.volume_ids.is_empty()
    }

    /// State derived purely from volume ids and mount paths.
    pub fn observed_state(&self) -> SnapshotState {
        if !self.has_volume() {
            SnapshotState::Absent
        } else if !self.mount_paths.is_empty() {
            SnapshotState::Mounted
        } else {
            SnapshotState::Created
        }
    }
}

impl Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Snapshot(job: {}, copy: {}, volumes: {}, state: {})",
            self.job_id,
            self.copy_id,
            self.volume_ids.len(),
            self.observed_state()
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, StrumDisplay, AsRefStr)]
pub enum JobKind {
    Backup,
    Restore,
    AuxCopy,
    BackupCopy,
    DataAging,
    ArrayOp,
    Reconcile,
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, StrumDisplay, EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum JobStatus {
    Running,
    Waiting,
    Suspended,
    Pending,
    Completed,
    Killed,
    Failed,
    #[strum(serialize = "Failed to Start")]
    FailedToStart,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Killed | JobStatus::Failed | JobStatus::FailedToStart
        )
    }

    /// Running or waiting, the only states a job can be suspended from.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Waiting)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub id: JobId,
    pub kind: JobKind,
}

impl JobHandle {
    pub fn new(id: JobId, kind: JobKind) -> Self {
        Self { id, kind }
    }
}

impl Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.id)
    }
}

/// Live job state. Polled, never cached beyond a single operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStatusReport {
    pub phase: String,
    pub status: JobStatus,
    pub delay_reason: Option<String>,
}

impl JobStatusReport {
    pub fn new(phase: impl Into<String>, status: JobStatus) -> Self {
        Self {
            phase: phase.into(),
            status,
            delay_reason: None,
        }
    }

    pub fn with_delay_reason(mut self, reason: impl Into<String>) -> Self {
        self.delay_reason = Some(reason.into());
        self
    }

    pub fn phase_is(&self, phase: &str) -> bool {
        self.phase.trim().eq_ignore_ascii_case(phase.trim())
    }

    pub fn reason(&self) -> &str {
        self.delay_reason.as_deref().unwrap_or("")
    }
}

/// Ordered phase names of a job, known before the job runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseOrder(Vec<String>);

impl PhaseOrder {
    pub fn new<I, S>(phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            phases
                .into_iter()
                .map(|p| p.as_ref().trim().to_ascii_lowercase())
                .collect(),
        )
    }

    pub fn position(&self, phase: &str) -> Option<usize> {
        let phase = phase.trim().to_ascii_lowercase();
        self.0.iter().position(|p| *p == phase)
    }

    /// Whether `current` is strictly later than `target`. Unknown phases are
    /// never considered past.
    pub fn is_past(&self, current: &str, target: &str) -> bool {
        match (self.position(current), self.position(target)) {
            (Some(current), Some(target)) => current > target,
            _ => false,
        }
    }

    pub fn phases(&self) -> &[String] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, StrumDisplay)]
pub enum BackupLevel {
    #[default]
    Full,
    Incremental,
    Differential,
    SyntheticFull,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BackupRequest {
    pub level: BackupLevel,
    pub skip_catalog: bool,
    pub inline_backup_copy: bool,
}

impl BackupRequest {
    pub fn phases(&self) -> PhaseOrder {
        if self.skip_catalog {
            PhaseOrder::new(["backup", "archive index"])
        } else {
            PhaseOrder::new(["backup", "scan", "catalog", "archive index"])
        }
    }
}

/// Phases of a backup copy job.
pub fn backup_copy_phases() -> PhaseOrder {
    PhaseOrder::new(["scan", "backup", "archive index"])
}

/// Job submissions understood by the job controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobRequest {
    Backup(BackupRequest),
    AuxCopy {
        policy: String,
        copy_name: Option<String>,
        use_scale: bool,
    },
    BackupCopy {
        policy: String,
    },
    DataAging {
        policy: String,
        copy_name: String,
    },
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Backup(_) => JobKind::Backup,
            JobRequest::AuxCopy { .. } => JobKind::AuxCopy,
            JobRequest::BackupCopy { .. } => JobKind::BackupCopy,
            JobRequest::DataAging { .. } => JobKind::DataAging,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountSpec {
    pub host: String,
    pub mount_path: PathBuf,
    pub vss_protection: bool,
}

impl MountSpec {
    pub fn location(&self) -> ContentLocation {
        ContentLocation::new(self.host.clone(), self.mount_path.clone())
    }
}

/// A directory on a host, either protected content or a mount target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentLocation {
    pub host: String,
    pub path: PathBuf,
}

impl ContentLocation {
    pub fn new(host: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
        }
    }
}

impl Display for ContentLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.path.display())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, StrumDisplay, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ArrayOpKind {
    Mount,
    Unmount,
    ForceUnmount,
    Revert,
    Delete,
    ForceDelete,
    Reconcile,
}

impl ArrayOpKind {
    /// Delete variants succeed without an array call when the volume is gone.
    pub fn tolerates_missing_volume(&self) -> bool {
        matches!(self, ArrayOpKind::Delete | ArrayOpKind::ForceDelete)
    }

    pub fn is_force(&self) -> bool {
        matches!(self, ArrayOpKind::ForceUnmount | ArrayOpKind::ForceDelete)
    }
}

/// One atomic array operation, each with the fields it needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ArrayOperation {
    Mount {
        volume_ids: Vec<VolumeId>,
        spec: MountSpec,
    },
    Unmount {
        volume_ids: Vec<VolumeId>,
    },
    ForceUnmount {
        volume_ids: Vec<VolumeId>,
    },
    Revert {
        volume_ids: Vec<VolumeId>,
    },
    Delete {
        volume_ids: Vec<VolumeId>,
    },
    ForceDelete {
        volume_ids: Vec<VolumeId>,
    },
    Reconcile {
        control_host: ControlHostId,
    },
}

impl ArrayOperation {
    pub fn kind(&self) -> ArrayOpKind {
        match self {
            ArrayOperation::Mount { .. } => ArrayOpKind::Mount,
            ArrayOperation::Unmount { .. } => ArrayOpKind::Unmount,
            ArrayOperation::ForceUnmount { .. } => ArrayOpKind::ForceUnmount,
            ArrayOperation::Revert { .. } => ArrayOpKind::Revert,
            ArrayOperation::Delete { .. } => ArrayOpKind::Delete,
            ArrayOperation::ForceDelete { .. } => ArrayOpKind::ForceDelete,
            ArrayOperation::Reconcile { .. } => ArrayOpKind::Reconcile,
        }
    }

    pub fn volume_ids(&self) -> &[VolumeId] {
        match self {
            ArrayOperation::Mount { volume_ids, .. } |
            ArrayOperation::Unmount { volume_ids } |
            ArrayOperation::ForceUnmount { volume_ids } |
            ArrayOperation::Revert { volume_ids } |
            ArrayOperation::Delete { volume_ids } |
            ArrayOperation::ForceDelete { volume_ids } => volume_ids,
            ArrayOperation::Reconcile { .. } => &[],
        }
    }

    /// Builds the volume-scoped operation of `kind`. Mount and reconcile
    /// carry extra fields and have no volume-only form.
    pub fn for_volumes(kind: ArrayOpKind, volume_ids: Vec<VolumeId>) -> Result<Self> {
        match kind {
            ArrayOpKind::Unmount => Ok(ArrayOperation::Unmount { volume_ids }),
            ArrayOpKind::ForceUnmount => Ok(ArrayOperation::ForceUnmount { volume_ids }),
            ArrayOpKind::Revert => Ok(ArrayOperation::Revert { volume_ids }),
            ArrayOpKind::Delete => Ok(ArrayOperation::Delete { volume_ids }),
            ArrayOpKind::ForceDelete => Ok(ArrayOperation::ForceDelete { volume_ids }),
            ArrayOpKind::Mount | ArrayOpKind::Reconcile => {
                Err(anyhow!("{} is not a volume-only operation", kind))
            }
        }
    }
}

impl Display for ArrayOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayOperation::Mount { volume_ids, spec } => write!(
                f,
                "mount({} volumes on {} at {})",
                volume_ids.len(),
                spec.host,
                spec.mount_path.display()
            ),
            ArrayOperation::Reconcile { control_host } => {
                write!(f, "reconcile(control host {})", control_host)
            }
            other => write!(f, "{}({} volumes)", other.kind(), other.volume_ids().len()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContentDiff {
    Missing(String),
    Unexpected(String),
    Changed(String),
}

impl Display for ContentDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentDiff::Missing(path) => write!(f, "missing: {}", path),
            ContentDiff::Unexpected(path) => write!(f, "unexpected: {}", path),
            ContentDiff::Changed(path) => write!(f, "changed: {}", path),
        }
    }
}

/// Relative file path to hex sha256 of its content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContentDigest(BTreeMap<String, String>);

impl ContentDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, hash: impl Into<String>) {
        self.0.insert(path.into(), hash.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Differences of `actual` measured against `self` as the expectation.
    pub fn diff(&self, actual: &ContentDigest) -> Vec<ContentDiff> {
        let mut diffs = Vec::new();
        for (path, hash) in &self.0 {
            match actual.0.get(path) {
                None => diffs.push(ContentDiff::Missing(path.clone())),
                Some(other) if other != hash => diffs.push(ContentDiff::Changed(path.clone())),
                Some(_) => {}
            }
        }
        for path in actual.0.keys() {
            if !self.0.contains_key(path) {
                diffs.push(ContentDiff::Unexpected(path.clone()));
            }
        }
        diffs
    }
}

impl FromIterator<(String, String)> for ContentDigest {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
