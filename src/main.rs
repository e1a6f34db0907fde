use clap::Parser;
use spreadwatch::adapters::{HttpTransport, ProxyRegistry, Transport};
use spreadwatch::cli::{self, Cli, Commands, OutputMode};
use spreadwatch::collector::HybridCollector;
use spreadwatch::config::AppConfig;
use spreadwatch::error::Result;
use spreadwatch::services::{api, MonitoringController};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    match cli.command.clone().unwrap_or(Commands::Serve) {
        Commands::Serve => {
            init_logging(&config.logging);
            run_serve(config).await?;
        }
        Commands::Markets { json } => {
            init_logging_simple();
            cli::list_markets(&config, OutputMode::from_json_flag(json)).await?;
        }
        Commands::Rank {
            snapshot,
            limit,
            json,
        } => {
            init_logging_simple();
            cli::rank_snapshot(
                &config,
                snapshot.as_deref(),
                limit,
                OutputMode::from_json_flag(json),
            )
            .await?;
        }
    }

    Ok(())
}

fn load_registry(config: &AppConfig) -> ProxyRegistry {
    let Some(path) = config.proxy.file.as_ref() else {
        info!("No proxy list configured, using direct mode");
        return ProxyRegistry::new();
    };

    match ProxyRegistry::from_file(path) {
        Ok(registry) if !registry.is_empty() => registry,
        Ok(_) => {
            warn!("Proxy list {} is empty, using direct mode", path.display());
            ProxyRegistry::new()
        }
        Err(e) => {
            warn!(
                "Could not read proxy list {} ({}), using direct mode",
                path.display(),
                e
            );
            ProxyRegistry::new()
        }
    }
}

async fn run_serve(config: AppConfig) -> Result<()> {
    info!("Starting spreadwatch");

    let registry = Arc::new(load_registry(&config));
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
    let collector = Arc::new(HybridCollector::new(config.clone(), transport, registry));

    match collector.restore_snapshot().await {
        Ok(0) => {}
        Ok(n) => info!("Restored windows for {} markets", n),
        Err(e) => warn!("Could not restore snapshot: {}", e),
    }

    if let Err(e) = collector.discover_markets().await {
        error!("Market discovery failed: {}", e);
    }

    let controller = MonitoringController::new(collector, config.session.duration());
    info!("Monitoring is on demand: POST /api/monitoring/start to begin collecting");

    api::serve(Arc::clone(&controller), config.server.port, shutdown_signal()).await?;

    if controller.is_active().await {
        if let Err(e) = controller.stop().await {
            error!("Failed to stop monitoring on shutdown: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
