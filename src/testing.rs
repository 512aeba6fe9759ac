use anyhow::Result;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::SnapConfig,
    service::{ScenarioSummary, Service},
};

pub struct TestService {
    pub service: Service,
}

impl TestService {
    pub async fn new(config: SnapConfig) -> Result<Self> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let srv = Service::new(config).await?;
        Ok(Self { service: srv })
    }

    pub async fn rehearse(&self, name: &str) -> Result<ScenarioSummary> {
        self.service
            .run(name, tokio_util::sync::CancellationToken::new())
            .await
    }
}
