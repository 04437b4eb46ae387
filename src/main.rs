//! thermgate - IoT telemetry gateway
//!
//! Accepts sensor node links, tracks their sessions, and persists readings to
//! SQLite while an operator console drives the gateway.

mod console;

use clap::Parser;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thermgate_server::metrics::run_metrics_server;
use thermgate_server::{
    Config, Gateway, GatewayContext, Reaper, Sampler, StorageWorker, ThresholdMonitor,
};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "thermgate")]
#[command(about = "IoT telemetry gateway for temperature sensor nodes")]
#[command(version)]
struct Cli {
    /// Port to listen on (overrides network.port)
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: Option<u16>,

    /// Path to a YAML config file
    #[arg(short, long, env = "THERMGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Run without the interactive console
    #[arg(long)]
    no_console: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    config.validate()?;

    init_logging(&config.logging.filter, config.logging.file.as_deref())?;
    if let Some(path) = &cli.config {
        tracing::info!("Loaded config from {}", path.display());
    }

    tracing::info!("Starting thermgate gateway");
    tracing::info!("  Bind address: {}", config.network.bind_addr());
    tracing::info!("  Database: {}", config.storage.db_path.display());
    tracing::info!(
        "  Admission: {} per address, {} addresses",
        config.admission.max_per_address,
        config.admission.max_addresses
    );
    if config.tls.enabled {
        tracing::info!("  TLS: enabled");
        if config.tls.require_client_cert {
            tracing::info!("  mTLS: enabled (client certificate required)");
        }
    } else {
        tracing::info!("  TLS: disabled");
    }

    let ctx = match GatewayContext::new(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!("Failed to initialize gateway: {}", e);
            return Err(e.into());
        }
    };

    let gateway = match Gateway::bind(ctx.clone()).await {
        Ok(gateway) => gateway,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", ctx.config.network.bind_addr(), e);
            return Err(e.into());
        }
    };
    let gateway_handle = tokio::spawn(gateway.run());

    let mut background = Vec::new();
    {
        let reaper = Reaper::new(ctx.clone());
        background.push(tokio::spawn(async move { reaper.run().await }));
    }
    {
        let sampler = Sampler::new(ctx.clone());
        background.push(tokio::spawn(async move { sampler.run().await }));
    }
    {
        let monitor = ThresholdMonitor::new(ctx.clone());
        background.push(tokio::spawn(async move { monitor.run().await }));
    }
    if let Some(metrics) = ctx.metrics.clone() {
        let addr = ctx.config.metrics.bind_addr;
        let stop = ctx.stop.clone();
        background.push(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, stop).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }));
    }
    let worker_handle = {
        let worker = StorageWorker::new(&ctx);
        tokio::spawn(async move { worker.run().await })
    };

    {
        let stop = ctx.stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal, stopping gateway...");
                stop.stop();
            }
        });
    }

    if !cli.no_console {
        let _console = console::spawn(ctx.clone(), tokio::runtime::Handle::current())?;
    }

    // The storage worker only returns early when the database is gone for
    // good, which takes the whole gateway down.
    let storage_result = match worker_handle.await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("Storage worker task failed: {}", e);
            Ok(())
        }
    };
    ctx.stop.stop();

    match gateway_handle.await {
        Ok(Err(e)) => tracing::error!("Gateway error: {}", e),
        Err(e) => tracing::error!("Gateway task failed: {}", e),
        Ok(Ok(())) => {}
    }
    for handle in background {
        let _ = handle.await;
    }

    if let Err(e) = storage_result {
        tracing::error!("Gateway stopped: {}", e);
        return Err(e.into());
    }
    tracing::info!("Gateway stopped");
    Ok(())
}

/// Logs to stdout, and appends a plain-text copy to `file` when set.
fn init_logging(filter: &str, file: Option<&Path>) -> std::io::Result<()> {
    let file_layer = match file {
        Some(path) => {
            let log_file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(log_file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}
