//! Polaris client runtime.
//!
//! Loads a configuration file, serves its static services through the
//! client core and keeps the background tasks (breaker timing, cache sweep,
//! health detection, config reload) running until ctrl-c.

use std::path::PathBuf;

use clap::Parser;

use polaris_client::config::watcher::ConfigWatcher;
use polaris_client::config::{load_config, PolarisConfig};
use polaris_client::observability::{logging, metrics};
use polaris_client::Context;

#[derive(Parser)]
#[command(name = "polaris-client")]
#[command(about = "Polaris client traffic-governance runtime", long_about = None)]
struct Args {
    /// Configuration file; defaults apply when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => PolarisConfig::default(),
    };

    logging::init_logging(&config.observability.log_level);
    tracing::info!("polaris-client v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    tracing::info!(
        services = config.services.len(),
        lb_type = %config.consumer.load_balancer.lb_type,
        breaker_chain = ?config.consumer.circuit_breaker.chain,
        router_chain = ?config.consumer.service_router.chain,
        "Configuration loaded"
    );

    let context = Context::new(config)?;
    let mut handles = context.start();

    // keep the notify watcher alive for the whole run
    let watcher = match &args.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let watcher = watcher.run()?;
            let reload_context = context.clone();
            handles.push(tokio::spawn(async move {
                while let Some(new_config) = updates.recv().await {
                    reload_context.reload_services(&new_config);
                }
            }));
            Some(watcher)
        }
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    context.shutdown();
    // the reload task ends with the watcher's channel
    drop(watcher);
    for handle in handles {
        let _ = handle.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
