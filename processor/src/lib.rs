pub mod error;
pub mod jobs;
pub mod lifecycle;
pub mod phase_controller;
pub mod retention;
pub mod settings;
pub mod topology;
pub mod validation;

#[cfg(test)]
mod scenario_tests;
#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

pub use error::{Error, ErrorClass, Result};
pub use jobs::JobRunner;
pub use lifecycle::{ReconcileReport, SnapshotLifecycleOrchestrator, TransitionOutcome};
pub use phase_controller::{
    PhaseSuspendResumeController,
    PhaseWait,
    SuspendOutcome,
    SuspendResumeReport,
};
pub use retention::RetentionAgingEngine;
pub use settings::{AgingSettings, MirrorAgingTarget, TimingSettings};
use state_store::Backends;
pub use topology::CopyTopology;
pub use validation::{AgingReport, ValidationEngine};

/// Every component wired against one set of backends and one storage
/// policy.
pub struct SnapEngine {
    pub topology: Arc<CopyTopology>,
    pub runner: Arc<JobRunner>,
    pub lifecycle: Arc<SnapshotLifecycleOrchestrator>,
    pub retention: Arc<RetentionAgingEngine>,
    pub validation: Arc<ValidationEngine>,
}

impl SnapEngine {
    pub fn new(
        backends: Backends,
        policy: &str,
        timings: TimingSettings,
        aging: AgingSettings,
        metrics: Arc<metrics::Metrics>,
    ) -> Self {
        let topology = Arc::new(CopyTopology::new(backends.copies.clone(), policy));
        let runner = Arc::new(JobRunner::new(
            backends.clone(),
            timings.clone(),
            metrics.clone(),
        ));
        let lifecycle = Arc::new(SnapshotLifecycleOrchestrator::new(
            backends.clone(),
            runner.clone(),
            timings.clone(),
            metrics.clone(),
        ));
        let retention = Arc::new(RetentionAgingEngine::new(
            backends.clone(),
            runner.clone(),
            timings.clone(),
            metrics,
        ));
        let validation = Arc::new(ValidationEngine::new(
            backends,
            retention.clone(),
            timings,
            aging,
        ));
        Self {
            topology,
            runner,
            lifecycle,
            retention,
            validation,
        }
    }
}
