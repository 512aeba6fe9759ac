use std::path::PathBuf;

use ::tracing::{error, info, info_span};
use clap::Parser;
use snap_orchestrator::{config::SnapConfig, service::Service, tracing::setup_tracing};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[arg(short, long, default_value = "rehearsal", help = "Scenario name")]
    scenario: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => match SnapConfig::from_path(&path.to_string_lossy()) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("invalid config {}: {:?}", path.display(), err);
                std::process::exit(2);
            }
        },
        None => SnapConfig::default(),
    };

    let tracing_provider = match setup_tracing(&config) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("error setting up tracing: {:?}", err);
            std::process::exit(2);
        }
    };
    let meter_provider = metrics::init_provider(
        config.telemetry.enable_metrics,
        config.telemetry.endpoint.as_ref(),
        config.telemetry.metrics_interval(),
        env!("CARGO_PKG_VERSION"),
    )
    .inspect_err(|e| error!("error setting up metrics: {:?}", e))
    .ok()
    .flatten();

    let root_span = info_span!(
        "snap-orchestrator",
        env = config.env,
        "snap-instance" = config.instance_id()
    );
    let _guard = root_span.enter();

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, cancelling scenario");
            ctrl_c.cancel();
        }
    });

    let mut failed = false;
    match Service::new(config).await {
        Ok(service) => match service.run(&cli.scenario, cancel).await {
            Ok(summary) => info!(
                scenario = summary.name,
                jobs = summary.jobs.len(),
                copies = summary.copies.len(),
                aged = summary.aging.len(),
                "scenario passed"
            ),
            Err(err) => {
                error!("scenario failed: {:?}", err);
                failed = true;
            }
        },
        Err(err) => {
            error!("error creating service: {:?}", err);
            failed = true;
        }
    }

    // export traces and metrics before shutdown
    if let Some(tracer_provider) = tracing_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("error shutting down tracer provider: {:?}", err);
        }
    }
    if let Some(meter_provider) = meter_provider {
        if let Err(err) = meter_provider.shutdown() {
            error!("error shutting down meter provider: {:?}", err);
        }
    }
    if failed {
        std::process::exit(1);
    }
}
