//! Release controller service running against in-memory backends.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use release_controller::backend::memory::{InMemoryJobBackend, InMemoryRegistry, Snapshot};
use release_controller::cli::Cli;
use release_controller::controller::{Controller, verify_namespaces};
use release_controller::observability::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_filter());

    let config = cli.controller_config()?;

    let snapshot = match &cli.seed {
        Some(path) => Snapshot::load(path)?,
        None => Snapshot::default(),
    };
    let registry = Arc::new(InMemoryRegistry::from_snapshot(&snapshot)?);
    let jobs = Arc::new(InMemoryJobBackend::from_snapshot(&snapshot));

    verify_namespaces(&config, registry.as_ref(), jobs.as_ref()).await?;

    let mirrors: Vec<String> = config
        .releases
        .iter()
        .filter_map(|release| release.mirror.as_ref())
        .map(|mirror| format!("{}/{}", mirror.namespace, mirror.stream))
        .collect();
    info!(
        "Jobs will be created in namespace {} and payloads recorded in namespace {}; mirrors: {}",
        config.job_namespace,
        config.release_namespace,
        if mirrors.is_empty() { "none".to_string() } else { mirrors.join(", ") },
    );

    if let Some(addr) = cli.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus recorder")?;
        info!(%addr, "serving metrics");
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("received interrupt, shutting down");
                    shutdown.cancel();
                }
                Err(error) => warn!(%error, "unable to listen for interrupt"),
            }
        });
    }

    let workers = config.workers;
    let controller = Controller::new(config, registry, jobs)?;
    controller.run(workers, shutdown).await?;
    Ok(())
}
