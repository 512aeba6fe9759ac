use std::{path::PathBuf, time::Duration};

use data_model::{
    ArrayOpKind,
    ContentDiff,
    CopyId,
    JobHandle,
    JobId,
    JobStatus,
    SnapshotState,
};
use strum::Display;
use thiserror::Error;

/// How a failure should be treated by whoever drives the scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorClass {
    /// Caller misuse. Never retried.
    Precondition,
    /// A retry budget for a known transient condition ran out.
    Transient,
    /// Not confirmed within budget. The operation may still complete.
    Timeout,
    Fatal,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("copy {name} already exists on policy {policy} with a different shape")]
    DuplicateCopy { policy: String, name: String },

    #[error("copy {name} cannot be deleted, it is the source of {dependents:?}")]
    CopyHasDependents {
        name: String,
        dependents: Vec<String>,
    },

    #[error("copy {name} with source {source_copy} would close a cycle")]
    TopologyCycle { name: String, source_copy: String },

    #[error("source copy {source_copy} of {name} does not exist")]
    MissingSourceCopy { name: String, source_copy: String },

    #[error("invalid copy {name}: {reason}")]
    InvalidCopy { name: String, reason: String },

    #[error("copy {name} not found on policy {policy}")]
    CopyNotFound { policy: String, name: String },

    #[error("{op}: no volume for job {job_id} on copy {copy_id}")]
    VolumeMissing {
        op: ArrayOpKind,
        job_id: JobId,
        copy_id: CopyId,
    },

    #[error("{op}: snapshot of job {job_id} on copy {copy_id} is {state}")]
    InvalidTransition {
        op: ArrayOpKind,
        job_id: JobId,
        copy_id: CopyId,
        state: SnapshotState,
    },

    #[error("revert of job {job_id} on copy {copy_id} refused: {reason}")]
    RevertPrecondition {
        job_id: JobId,
        copy_id: CopyId,
        reason: String,
    },

    #[error("no aging run covers copy {copy}")]
    AgingNotRun { copy: String },

    #[error("job {job_id} is not tracked by the scenario")]
    UntrackedJob { job_id: JobId },

    #[error("snapshot of job {job_id} not found on copy {copy} after completion")]
    SnapshotNotCreated { job_id: JobId, copy: String },

    #[error("job {job} ended {status}: {reason}")]
    JobFailed {
        job: JobHandle,
        status: JobStatus,
        reason: String,
    },

    #[error("job {job_id} could not be killed in phase {phase}: {status}")]
    KillMissed {
        job_id: JobId,
        phase: String,
        status: JobStatus,
    },

    #[error("data aging for copy {copy} failed to start {attempts} times")]
    AgingFailedToStart { copy: String, attempts: u32 },

    #[error("job {job_id} did not reach {target} after {attempts} polls, last seen {last_phase}/{last_status:?}")]
    PhaseTimeout {
        job_id: JobId,
        target: String,
        attempts: u32,
        last_phase: String,
        last_status: Option<JobStatus>,
    },

    #[error("job {job} still {last_status} after {attempts} polls")]
    JobTimeout {
        job: JobHandle,
        attempts: u32,
        last_status: JobStatus,
    },

    #[error("no inline backup copy job found for job {job_id} after {attempts} polls")]
    BackupCopyNotFound { job_id: JobId, attempts: u32 },

    #[error("{op} of job {job_id} on copy {copy_id} not confirmed after {attempts} polls")]
    PostConditionTimeout {
        op: ArrayOpKind,
        job_id: JobId,
        copy_id: CopyId,
        attempts: u32,
    },

    #[error("snapshot of job {job_id} on copy {copy} still present after {waited:?}, unpruned: {remaining:?}")]
    PruningTimeout {
        job_id: JobId,
        copy: String,
        remaining: Vec<JobId>,
        waited: Duration,
    },

    #[error("content mismatch under {path:?}: {diffs:?}")]
    ContentMismatch {
        path: PathBuf,
        diffs: Vec<ContentDiff>,
    },

    #[error("mount paths survived unmount on {host}: {paths:?}")]
    MountLeak { host: String, paths: Vec<PathBuf> },

    #[error("reconcile failed on {failed:?}")]
    ReconcileFailed { failed: Vec<(String, String)> },

    #[error("cancelled while {during}")]
    Cancelled { during: String },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::DuplicateCopy { .. } |
            Error::CopyHasDependents { .. } |
            Error::TopologyCycle { .. } |
            Error::MissingSourceCopy { .. } |
            Error::InvalidCopy { .. } |
            Error::CopyNotFound { .. } |
            Error::VolumeMissing { .. } |
            Error::InvalidTransition { .. } |
            Error::RevertPrecondition { .. } |
            Error::AgingNotRun { .. } |
            Error::UntrackedJob { .. } => ErrorClass::Precondition,
            Error::AgingFailedToStart { .. } => ErrorClass::Transient,
            Error::PhaseTimeout { .. } |
            Error::JobTimeout { .. } |
            Error::BackupCopyNotFound { .. } |
            Error::PostConditionTimeout { .. } |
            Error::PruningTimeout { .. } => ErrorClass::Timeout,
            Error::SnapshotNotCreated { .. } |
            Error::JobFailed { .. } |
            Error::KillMissed { .. } |
            Error::ContentMismatch { .. } |
            Error::MountLeak { .. } |
            Error::ReconcileFailed { .. } |
            Error::Backend(_) => ErrorClass::Fatal,
            Error::Cancelled { .. } => ErrorClass::Cancelled,
        }
    }

    /// The operation was not confirmed within its budget. It may still
    /// complete out of band.
    pub fn is_timeout(&self) -> bool {
        self.class() == ErrorClass::Timeout
    }

    pub fn is_precondition(&self) -> bool {
        self.class() == ErrorClass::Precondition
    }

    pub fn cancelled(during: impl Into<String>) -> Self {
        Error::Cancelled {
            during: during.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use data_model::{ArrayOpKind, CopyId, JobId};

    use super::{Error, ErrorClass};

    #[test]
    fn test_error_classes() {
        let missing = Error::VolumeMissing {
            op: ArrayOpKind::Mount,
            job_id: JobId::new(1),
            copy_id: CopyId::new(2),
        };
        assert!(missing.is_precondition());
        assert_eq!(missing.to_string(), "mount: no volume for job 1 on copy 2");

        let timeout = Error::PruningTimeout {
            job_id: JobId::new(1),
            copy: "Snap1".to_string(),
            remaining: vec![JobId::new(1)],
            waited: std::time::Duration::from_secs(2280),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_precondition());

        let backend: Error = anyhow::anyhow!("connection refused").into();
        assert_eq!(backend.class(), ErrorClass::Fatal);
        assert_eq!(Error::cancelled("polling").class(), ErrorClass::Cancelled);
    }
}
