//! Collaborators of the orchestrator: the metadata store, the job scheduler,
//! the array operation endpoint, copy persistence and the hosts snapshots
//! are mounted on.
//!
//! All of them are external systems. The traits here are the seams the
//! processor is written against; [`SimulatedBackend`] implements every one
//! of them in memory and [`LocalMountHost`] reads real directories.

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use data_model::{
    ArrayOperation,
    ContentDigest,
    ContentLocation,
    ControlHostId,
    CopyId,
    JobHandle,
    JobId,
    JobRequest,
    JobStatusReport,
    Retention,
    StorageCopy,
    VolumeId,
};

pub mod local_mount;
pub mod simulated;

pub use local_mount::LocalMountHost;
pub use simulated::{JobScript, SimSettings, SimulatedBackend};

/// Read-only view of the identifiers the backup system records.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Volumes of the snapshot `(job_id, copy_id)`. Empty when the snapshot
    /// does not exist or has been pruned.
    async fn volume_ids(&self, job_id: JobId, copy_id: CopyId) -> Result<Vec<VolumeId>>;

    async fn mount_paths(&self, job_id: JobId, copy_id: CopyId) -> Result<Vec<PathBuf>>;

    async fn control_host_id(&self, array_name: &str) -> Result<ControlHostId>;

    /// Arrays holding any snapshot of `job_id`.
    async fn arrays_for_job(&self, job_id: JobId) -> Result<Vec<String>>;

    /// The backup copy job started inline by a backup, once it is known.
    async fn backup_copy_job(&self, job_id: JobId) -> Result<Option<JobId>>;
}

#[async_trait]
pub trait JobController: Send + Sync {
    async fn submit(&self, request: JobRequest) -> Result<JobHandle>;

    async fn status(&self, job: &JobHandle) -> Result<JobStatusReport>;

    async fn pause(&self, job: &JobHandle) -> Result<()>;

    async fn resume(&self, job: &JobHandle) -> Result<()>;

    async fn kill(&self, job: &JobHandle) -> Result<()>;
}

#[async_trait]
pub trait ArrayOperationClient: Send + Sync {
    /// Starts `op` on the array. The returned job is tracked through the
    /// [`JobController`].
    async fn execute(&self, op: ArrayOperation) -> Result<JobHandle>;
}

#[async_trait]
pub trait CopyPersistence: Send + Sync {
    async fn get_copy(&self, policy: &str, name: &str) -> Result<Option<StorageCopy>>;

    /// Persists `copy` and returns it with its assigned id.
    async fn create_copy(&self, copy: StorageCopy) -> Result<StorageCopy>;

    async fn delete_copy(&self, policy: &str, name: &str) -> Result<()>;

    async fn update_retention(&self, policy: &str, name: &str, retention: Retention) -> Result<()>;

    /// Copies of `policy` in creation order.
    async fn list_copies(&self, policy: &str) -> Result<Vec<StorageCopy>>;
}

/// Filesystem access on the hosts content is protected from and mounted on.
#[async_trait]
pub trait MountHost: Send + Sync {
    async fn exists(&self, location: &ContentLocation) -> Result<bool>;

    /// True when the directory is missing or holds no files.
    async fn is_cleared(&self, location: &ContentLocation) -> Result<bool>;

    async fn digest(&self, location: &ContentLocation) -> Result<ContentDigest>;

    async fn clear(&self, location: &ContentLocation) -> Result<()>;
}

/// The set of collaborators one scenario runs against.
#[derive(Clone)]
pub struct Backends {
    pub metadata: Arc<dyn MetadataStore>,
    pub jobs: Arc<dyn JobController>,
    pub array: Arc<dyn ArrayOperationClient>,
    pub copies: Arc<dyn CopyPersistence>,
    pub mount_host: Arc<dyn MountHost>,
}

impl Backends {
    /// Every collaborator served by one simulated backend.
    pub fn simulated(backend: Arc<SimulatedBackend>) -> Self {
        Self {
            metadata: backend.clone(),
            jobs: backend.clone(),
            array: backend.clone(),
            copies: backend.clone(),
            mount_host: backend,
        }
    }

    pub fn with_mount_host(mut self, mount_host: Arc<dyn MountHost>) -> Self {
        self.mount_host = mount_host;
        self
    }
}
