use anyhow::Result;
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};
use tracing::warn;
use tracing_subscriber::{
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer,
    Registry,
};

use crate::config::{SnapConfig, TelemetryConfig};

const DEFAULT_DIRECTIVES: &str = "warn,snap_orchestrator=info,processor=info,state_store=info,metrics=info";

/// `RUST_LOG` when set, otherwise info for the orchestrator crates only.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

fn log_layer(structured: bool) -> Box<dyn Layer<Registry> + Send + Sync> {
    if structured {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .boxed()
    }
}

fn tracer_provider(telemetry: &TelemetryConfig, instance_id: String) -> Result<SdkTracerProvider> {
    let mut exporter = SpanExporter::builder().with_tonic();
    if let Some(endpoint) = &telemetry.endpoint {
        exporter = exporter.with_endpoint(endpoint.clone());
    }
    let resource = Resource::builder()
        .with_service_name("snap-orchestrator")
        .with_attribute(KeyValue::new("service.instance.id", instance_id))
        .build();
    let provider = SdkTracerProvider::builder()
        .with_resource(resource)
        .with_batch_exporter(exporter.build()?)
        .build();
    global::set_tracer_provider(provider.clone());
    Ok(provider)
}

/// Installs the global subscriber: filtered logs, plus scenario spans
/// exported over OTLP when `telemetry.enable_tracing` is set. The returned
/// provider must be shut down to flush pending spans.
pub fn setup_tracing(config: &SnapConfig) -> Result<Option<SdkTracerProvider>> {
    let provider = if config.telemetry.enable_tracing {
        Some(tracer_provider(&config.telemetry, config.instance_id())?)
    } else {
        None
    };
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("snap-orchestrator")));

    let installed = tracing_subscriber::registry()
        .with(log_layer(config.structured_logging()).with_filter(env_filter()))
        .with(otel_layer)
        .try_init();
    if let Err(err) = installed {
        warn!(%err, "subscriber already installed, keeping it");
    }
    Ok(provider)
}
