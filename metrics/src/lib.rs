use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{metrics::Histogram, KeyValue};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};
use tracing::info;

/// Buckets for job waits, which range from seconds to the better part of an
/// hour.
pub fn long_wait_boundaries() -> Vec<f64> {
    vec![
        1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 2400.0, 3600.0, 7200.0,
    ]
}

pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    service_version: &str,
) -> Result<Option<SdkMeterProvider>> {
    if !enable_metrics {
        return Ok(None);
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "snap"))
        .with_attribute(KeyValue::new("service.name", "snap-orchestrator"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider.clone());
    info!(?interval, "metrics exporter installed");
    Ok(Some(provider))
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the elapsed time into `metric` when dropped.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: Vec<KeyValue>,
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start_with_labels(metric: &'a T, labels: &[KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels: labels.to_vec(),
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), &self.labels);
    }
}

pub mod snap_stats {
    use opentelemetry::{
        metrics::{Counter, Histogram},
        KeyValue,
    };

    use super::long_wait_boundaries;

    #[derive(Debug, Clone)]
    pub struct Metrics {
        pub array_operations: Counter<u64>,
        pub job_wait_duration: Histogram<f64>,
        pub poll_attempts: Counter<u64>,
        pub pruning_timeouts: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("snap-orchestrator");
            let array_operations = meter
                .u64_counter("snap.array_operations")
                .with_description("array operations submitted, by operation and outcome")
                .build();
            let job_wait_duration = meter
                .f64_histogram("snap.job_wait_duration")
                .with_unit("s")
                .with_boundaries(long_wait_boundaries())
                .with_description("time spent waiting for jobs to reach a terminal status")
                .build();
            let poll_attempts = meter
                .u64_counter("snap.poll_attempts")
                .with_description("probes issued by bounded poll loops")
                .build();
            let pruning_timeouts = meter
                .u64_counter("snap.pruning_timeouts")
                .with_description("snapshots that were not pruned within the poll ceiling")
                .build();
            Metrics {
                array_operations,
                job_wait_duration,
                poll_attempts,
                pruning_timeouts,
            }
        }

        pub fn record_array_op(&self, op: &str, outcome: &str) {
            self.array_operations.add(
                1,
                &[
                    KeyValue::new("op", op.to_string()),
                    KeyValue::new("outcome", outcome.to_string()),
                ],
            );
        }

        pub fn record_polls(&self, loop_name: &'static str, attempts: u32) {
            self.poll_attempts
                .add(attempts as u64, &[KeyValue::new("loop", loop_name)]);
        }
    }
}

pub use snap_stats::Metrics;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use opentelemetry::KeyValue;

    use super::*;

    #[test]
    fn test_disabled_provider_is_noop() {
        let provider = init_provider(false, None, Duration::from_secs(5), "test").unwrap();
        assert!(provider.is_none());
    }

    #[test]
    fn test_instruments_record_without_provider() {
        let metrics = Metrics::new();
        metrics.record_array_op("mount", "ok");
        metrics.record_polls("phase_wait", 3);
        metrics
            .pruning_timeouts
            .add(1, &[KeyValue::new("copy", "Snap1")]);
        let labels = [KeyValue::new("kind", "Backup")];
        let _timer = Timer::start_with_labels(&metrics.job_wait_duration, &labels);
    }
}
