//! Metrics exporter binary: wires collectors, scheduler and HTTP server together.

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter::collector::{
    ComposeStatusCollector, ContainerMetricsCollector, HostMetricsCollector, TopProcessCollector,
};
use metrics_exporter::config::{Args, ExporterConfig};
use metrics_exporter::docker::{self, ContainerRuntime, DockerRuntime};
use metrics_exporter::{exporter, logging, CollectorSpec, Registry, Scheduler};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn main() -> Result<()> {
    logging::init();

    let config = ExporterConfig::from_args(Args::parse()).context("Invalid configuration")?;
    let grace = config.shutdown_grace;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let result = runtime.block_on(run(config));

    // A read stuck on a dead mount holds a blocking thread that would never
    // let a plain runtime drop return
    runtime.shutdown_timeout(grace);
    result
}

async fn run(config: ExporterConfig) -> Result<()> {
    tracing::info!(
        listen = %config.listen,
        procfs = %config.procfs.root().display(),
        interval = ?config.host_interval,
        docker_interval = ?config.docker_interval,
        "Starting metrics exporter"
    );

    let registry = Arc::new(Registry::new());
    let mut scheduler =
        Scheduler::new(Arc::clone(&registry)).with_grace_period(config.shutdown_grace);

    scheduler
        .add(CollectorSpec::new(
            HostMetricsCollector::new(config.procfs.clone()),
            config.host_interval,
        ))
        .add(CollectorSpec::new(
            TopProcessCollector::new(config.procfs.clone(), config.top_processes),
            config.host_interval,
        ));

    match &config.docker_socket {
        Some(socket) => match DockerRuntime::connect(socket) {
            Ok(runtime) => {
                let runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime);
                let checked = Arc::clone(&runtime);
                tokio::spawn(async move { docker::check_connectivity(checked.as_ref()).await });

                let mut compose = ComposeStatusCollector::new(Arc::clone(&runtime));
                if let Some(project) = &config.compose_project {
                    compose = compose.with_project(project);
                }
                scheduler
                    .add(CollectorSpec::new(
                        ContainerMetricsCollector::new(runtime),
                        config.docker_interval,
                    ))
                    .add(CollectorSpec::new(compose, config.docker_interval));
            }
            Err(e) => tracing::warn!(
                socket = %socket.display(),
                error = %e,
                "Could not create Docker client, container metrics disabled"
            ),
        },
        None => tracing::info!("Container metrics disabled"),
    }

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    tracing::info!("Serving metrics on http://{}/metrics", config.listen);

    let shutdown = CancellationToken::new();
    let collectors = tokio::spawn(scheduler.run(shutdown.clone()));
    let mut server = tokio::spawn(exporter::serve(
        listener,
        Arc::clone(&registry),
        shutdown.clone(),
    ));

    let server_result = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut server => Some(result),
    };

    tracing::info!("Shutting down");
    shutdown.cancel();

    let server_result = match server_result {
        Some(result) => result,
        None => server.await,
    };
    if let Err(e) = collectors.await {
        tracing::error!(error = %e, "Collector scheduler terminated abnormally");
    }

    server_result
        .context("HTTP server task failed")?
        .context("HTTP server failed")?;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        _ = terminate => tracing::info!("Received terminate signal"),
    }
}
