use std::sync::Arc;

use data_model::{
    test_objects::tests::{
        mock_backup_request,
        mock_content,
        mock_content_location,
        mock_scenario,
        test_arrays,
        TEST_ARRAY,
        TEST_POLICY,
        TEST_PRIMARY_COPY,
    },
    ControlHostId,
    CopyKind,
    JobHandle,
    Retention,
    ScenarioContext,
    StorageCopy,
};
use state_store::{Backends, SimSettings, SimulatedBackend};

use crate::{
    settings::{AgingSettings, TimingSettings},
    SnapEngine,
};

/// A simulated backend with registered arrays, protected content and the
/// primary snap copy, plus an engine and scenario wired against it.
pub struct TestHarness {
    pub backend: Arc<SimulatedBackend>,
    pub engine: SnapEngine,
    pub ctx: ScenarioContext,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_settings(SimSettings::default(), TimingSettings::default()).await
    }

    pub async fn with_settings(sim: SimSettings, timings: TimingSettings) -> Self {
        let backend = Arc::new(SimulatedBackend::new(sim));
        for (idx, array) in test_arrays().iter().enumerate() {
            backend
                .register_array(array, ControlHostId::new(idx as u64 + 1))
                .await;
        }
        backend
            .set_protected_content(mock_content_location(), mock_content())
            .await;

        let engine = SnapEngine::new(
            Backends::simulated(backend.clone()),
            TEST_POLICY,
            timings,
            AgingSettings::default(),
            Arc::new(metrics::Metrics::new()),
        );
        engine
            .topology
            .create_copy(
                TEST_PRIMARY_COPY,
                CopyKind::Snap,
                None,
                TEST_ARRAY,
                Retention::default(),
            )
            .await
            .unwrap();

        Self {
            backend,
            engine,
            ctx: mock_scenario(),
        }
    }

    pub async fn backup(&mut self) -> JobHandle {
        self.engine
            .runner
            .run_backup(&mut self.ctx, mock_backup_request(), false)
            .await
            .unwrap()
    }

    pub async fn primary(&self) -> StorageCopy {
        self.engine.topology.get_copy(TEST_PRIMARY_COPY).await.unwrap()
    }
}
