//! Runnable Epoch simulation.
//!
//! Wires the orchestration core to the demonstration engines and drives
//! the tick loop until it is interrupted or reaches `max_ticks`.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `epoch-config.yaml` (or `EPOCH_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Build the orchestrator with in-memory persistence and metrics
//! 4. Register the demonstration engines
//! 5. Initialize the configured scenario
//! 6. Run the tick loop; Ctrl-C requests a stop
//! 7. Shut engines down and log the summaries

mod engines;
mod error;

use std::path::PathBuf;
use std::sync::Arc;

use epoch_core::config::LoggingConfig;
use epoch_core::{InMemoryMetrics, InMemoryPersistence, Orchestrator, SimulationConfig};
use epoch_types::{Location, ScenarioId};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineBinaryError;

/// Environment variable naming the configuration file.
const CONFIG_ENV_VAR: &str = "EPOCH_CONFIG";

/// Configuration file used when `EPOCH_CONFIG` is unset.
const DEFAULT_CONFIG_PATH: &str = "epoch-config.yaml";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration, startup, the tick loop, or shutdown
/// fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    run().await?;
    Ok(())
}

async fn run() -> Result<(), EngineBinaryError> {
    // 1. Load configuration.
    let (config, source) = load_config()?;

    // 2. Initialize structured logging.
    init_tracing(&config.logging);
    info!("epoch-engine starting");
    match &source {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("Config file not found, using defaults"),
    }
    info!(
        seed = config.world.seed,
        scenario = config.scenario.id,
        tick_interval_ms = config.scheduler.tick_interval_ms,
        seconds_per_tick = config.scheduler.seconds_per_tick,
        max_ticks = config.scheduler.max_ticks,
        "Simulation settings"
    );

    // 3. Build the orchestrator.
    let metrics = Arc::new(InMemoryMetrics::new());
    let persistence = Arc::new(InMemoryPersistence::new());
    let scenario = config.scenario.clone();
    let mut orchestrator = Orchestrator::new(config)?
        .with_metrics(metrics.clone())
        .with_persistence(persistence.clone());

    // 4. Register engines.
    for engine in engines::demonstration_engines() {
        orchestrator.register_engine(engine)?;
    }

    // 5. Initialize the scenario.
    orchestrator
        .initialize(
            ScenarioId::new(scenario.id),
            scenario.start,
            Location::new(scenario.location),
        )
        .await?;

    // 6. Stop on Ctrl-C, then run.
    let scheduler = orchestrator.scheduler();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping tick loop");
            if let Err(err) = scheduler.stop() {
                warn!(error = %err, "Stop request ignored");
            }
        }
    });

    let outcome = orchestrator.start().await;

    // 7. Shut down even if the loop halted, then report.
    let shutdown = orchestrator.stop().await;
    let summary = outcome?;
    info!(
        reason = ?summary.end,
        ticks_executed = summary.ticks_executed,
        final_tick = summary.final_tick,
        final_time = %summary.final_time,
        "Tick loop finished"
    );

    let recorded = metrics.summary();
    info!(
        ticks = recorded.ticks,
        mean_tick_us = u64::try_from(recorded.mean_tick_time().as_micros()).unwrap_or(u64::MAX),
        max_tick_us = u64::try_from(recorded.max_tick_time.as_micros()).unwrap_or(u64::MAX),
        "Tick metrics"
    );
    for (engine, stats) in &recorded.engines {
        info!(
            engine = %engine,
            calls = stats.calls,
            failures = stats.failures,
            mean_latency_us = u64::try_from(stats.mean_latency().as_micros()).unwrap_or(u64::MAX),
            "Engine metrics"
        );
    }
    if let Some(bus) = recorded.bus {
        info!(
            published = bus.published,
            delivered = bus.delivered,
            dropped = bus.dropped,
            handler_errors = bus.handler_errors,
            "Event bus metrics"
        );
    }

    shutdown?;
    info!(
        stored_snapshots = persistence.ticks().await.len(),
        "epoch-engine shutdown complete"
    );
    Ok(())
}

/// Load configuration from `EPOCH_CONFIG` or `epoch-config.yaml`.
///
/// Returns the path actually read, or `None` when falling back to defaults.
fn load_config() -> Result<(SimulationConfig, Option<PathBuf>), EngineBinaryError> {
    let path = std::env::var_os(CONFIG_ENV_VAR)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    if path.exists() {
        let config = SimulationConfig::from_file(&path)?;
        Ok((config, Some(path)))
    } else {
        let mut config = SimulationConfig::default();
        config.apply_env_overrides()?;
        Ok((config, None))
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
