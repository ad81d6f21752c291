//! ---
//! ems_section: "04-daemon"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the Helios daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use helios_common::{init_tracing, AppConfig};
use helios_core::{SourceAdapter, SourceFilter, SourceOrchestrator};
use helios_metrics::{new_registry, spawn_http_server, EngineMetrics};
use helios_sources::{
    DecoderRegistry, InMemorySourceStore, ModbusAdapter, MqttAdapter, RestAdapter,
    SmaEnergyMeterAdapter,
};
use helios_values::SourceUsage;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Helios acquisition daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "SECONDS",
        help = "Override the scheduler tick interval"
    )]
    tick_interval: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the acquisition engine")]
    Run,
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/helios.toml"));
    candidates.push(PathBuf::from("configs/helios.dev.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(seconds) = cli.tick_interval {
        config.engine.tick_interval = Duration::from_secs(seconds.max(1));
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("heliosd", &config.logging)?;
            info!(config_path = %loaded.source.display(), sources = config.sources.len(), "configuration loaded");
            run_daemon(config).await
        }
        Commands::CheckConfig => {
            // validate() already ran during load; report and exit.
            println!(
                "{}: ok ({} sources, tick every {:?})",
                loaded.source.display(),
                config.sources.len(),
                config.engine.tick_interval
            );
            Ok(())
        }
    }
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let registry = new_registry();
    let engine_metrics = EngineMetrics::new(registry.clone())?;
    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let store = Arc::new(InMemorySourceStore::new(
        DecoderRegistry::with_defaults(),
        config.sources.clone(),
    ));
    let capacity = config.engine.history_capacity;
    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
        Arc::new(ModbusAdapter::new(store.clone(), capacity)),
        Arc::new(RestAdapter::new(store.clone(), capacity)),
        Arc::new(MqttAdapter::new(store.clone(), capacity)),
        Arc::new(SmaEnergyMeterAdapter::new(store.clone(), capacity)),
    ];
    let orchestrator = Arc::new(SourceOrchestrator::new(adapters, Some(engine_metrics)));

    let report = orchestrator.recreate(&SourceFilter::all()).await;
    if report.added == 0 {
        warn!("no acquisition units were built; check the source configuration");
    }

    let shutdown = CancellationToken::new();
    let mut ticker = tokio::time::interval(config.engine.tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(tick = ?config.engine.tick_interval, units = orchestrator.unit_count(), "engine running");
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                let report = orchestrator.tick(Utc::now(), &shutdown).await;
                if report.failed > 0 {
                    warn!(failed = report.failed, refreshed = report.refreshed, "tick completed with failures");
                }
                let merged = orchestrator.aggregate(&SourceUsage::ALL, config.engine.skip_errored_sources);
                for (usage, readings) in &merged {
                    debug!(usage = %usage, readings = readings.len(), latest = ?readings.last(), "aggregated view");
                }
            }
        }
    }

    shutdown.cancel();
    orchestrator.shutdown().await;
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    info!("daemon stopped");
    Ok(())
}
