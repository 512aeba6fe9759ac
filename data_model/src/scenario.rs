use std::{collections::BTreeMap, path::PathBuf};

use tokio_util::sync::CancellationToken;

use crate::{JobId, LayoutCopies, ReplicationLayout};

/// Per-scenario bookkeeping passed explicitly to every component.
///
/// Holds the jobs run so far, the copies a layout produced, the aging runs
/// per copy, the last mount paths and the cancellation token that bounds the
/// whole scenario.
#[derive(Debug, Clone)]
pub struct ScenarioContext {
    pub name: String,
    pub policy: String,
    pub primary_copy: String,
    pub layout: Option<ReplicationLayout>,
    pub copies: LayoutCopies,
    pub job_tracker: Vec<JobId>,
    pub aging_runs: BTreeMap<String, JobId>,
    pub mount_paths: Vec<PathBuf>,
    cancel: CancellationToken,
}

impl ScenarioContext {
    pub fn new(
        name: impl Into<String>,
        policy: impl Into<String>,
        primary_copy: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            policy: policy.into(),
            primary_copy: primary_copy.into(),
            layout: None,
            copies: LayoutCopies::default(),
            job_tracker: Vec::new(),
            aging_runs: BTreeMap::new(),
            mount_paths: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn track_job(&mut self, job_id: JobId) {
        if !self.job_tracker.contains(&job_id) {
            self.job_tracker.push(job_id);
        }
    }

    pub fn record_aging(&mut self, copy_name: &str, job_id: JobId) {
        self.aging_runs.insert(copy_name.to_string(), job_id);
    }

    pub fn aging_ran_for(&self, copy_name: &str) -> bool {
        self.aging_runs.contains_key(copy_name)
    }

    /// All secondary copies the scenario created.
    pub fn secondary_copies(&self) -> &[String] {
        &self.copies.created
    }
}
