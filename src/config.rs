use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, Context, Result};
use data_model::ReplicationLayout;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use processor::{AgingSettings, TimingSettings};
use serde::{Deserialize, Serialize};
use state_store::SimSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enable_tracing: bool,
    pub enable_metrics: bool,
    /// OTLP collector, the exporter default when unset.
    pub endpoint: Option<String>,
    pub metrics_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_tracing: false,
            enable_metrics: false,
            endpoint: None,
            metrics_interval_secs: 10,
        }
    }
}

impl TelemetryConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapConfig {
    pub env: String,
    pub policy_name: String,
    pub primary_copy: String,
    /// Array per tier, primary first.
    pub arrays: Vec<String>,
    pub layout: Option<ReplicationLayout>,
    pub mount_host: String,
    pub mount_path: PathBuf,
    pub content_path: PathBuf,
    pub backups: usize,
    pub suspend_jobs: bool,
    pub skip_catalog: bool,
    pub inline_backup_copy: bool,
    pub timings: TimingSettings,
    pub aging: AgingSettings,
    pub simulation: SimSettings,
    pub telemetry: TelemetryConfig,
    pub structured_logging: bool,
}

impl Default for SnapConfig {
    fn default() -> Self {
        SnapConfig {
            env: "local".to_string(),
            policy_name: "snap_sp".to_string(),
            primary_copy: "Snap1".to_string(),
            arrays: vec![
                "array_a".to_string(),
                "array_b".to_string(),
                "array_c".to_string(),
            ],
            layout: Some(ReplicationLayout::Pvm),
            mount_host: "proxy_ma".to_string(),
            mount_path: PathBuf::from("/mnt/snaps"),
            content_path: PathBuf::from("/data/testdata"),
            backups: 3,
            suspend_jobs: false,
            skip_catalog: false,
            inline_backup_copy: false,
            timings: TimingSettings::default(),
            aging: AgingSettings::default(),
            simulation: SimSettings::default(),
            telemetry: TelemetryConfig::default(),
            structured_logging: false,
        }
    }
}

impl SnapConfig {
    pub fn from_path(path: &str) -> Result<SnapConfig> {
        let config_str =
            std::fs::read_to_string(path).with_context(|| format!("reading config {}", path))?;
        let config: SnapConfig = Figment::new()
            .merge(Yaml::string(&config_str))
            .extract()
            .with_context(|| format!("parsing config {}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.policy_name.trim().is_empty() {
            return Err(anyhow!("policy_name must not be empty"));
        }
        if self.primary_copy.trim().is_empty() {
            return Err(anyhow!("primary_copy must not be empty"));
        }
        if self.arrays.is_empty() {
            return Err(anyhow!("at least one array is required"));
        }
        if let Some(layout) = self.layout {
            if self.arrays.len() < layout.tiers() {
                return Err(anyhow!(
                    "layout {} spans {} arrays, {} configured",
                    layout,
                    layout.tiers(),
                    self.arrays.len()
                ));
            }
        }
        if let Some((name, _)) = self
            .timings
            .poll_budgets()
            .into_iter()
            .find(|(_, budget)| *budget == 0)
        {
            return Err(anyhow!("timings.{} must be greater than zero", name));
        }
        if self.aging.jobs_per_cycle != self.simulation.jobs_per_cycle {
            return Err(anyhow!(
                "aging.jobs_per_cycle ({}) differs from simulation.jobs_per_cycle ({})",
                self.aging.jobs_per_cycle,
                self.simulation.jobs_per_cycle
            ));
        }
        if self.backups == 0 {
            return Err(anyhow!("backups must be greater than zero"));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.structured_logging
    }

    pub fn instance_id(&self) -> String {
        format!("{}/{}", self.env, self.policy_name)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use data_model::ReplicationLayout;
    use processor::MirrorAgingTarget;

    use super::SnapConfig;

    #[test]
    fn test_parse_yaml_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
policy_name: sp_pvm
layout: pmv_replica
timings:
  phase_poll_secs: 5
  pruning_poll_attempts: 3
aging:
  mirror_target: mirror
simulation:
  phase_secs: 2
"#
        )
        .unwrap();

        let config = SnapConfig::from_path(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.policy_name, "sp_pvm");
        assert_eq!(config.layout, Some(ReplicationLayout::PmvReplica));
        assert_eq!(config.timings.phase_poll_secs, 5);
        assert_eq!(config.timings.pruning_poll_attempts, 3);
        assert_eq!(config.timings.suspend_poll_secs, 20);
        assert_eq!(config.aging.mirror_target, MirrorAgingTarget::Mirror);
        assert_eq!(config.simulation.phase_secs, 2);
        assert_eq!(config.primary_copy, "Snap1");
    }

    #[test]
    fn test_validation() {
        assert!(SnapConfig::default().validate().is_ok());

        let config = SnapConfig {
            arrays: vec!["array_a".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = SnapConfig::default();
        config.timings.resume_poll_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("resume_poll_attempts"));

        let config = SnapConfig {
            policy_name: " ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
