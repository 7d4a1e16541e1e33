//! Configuration loading and typed config structures for the Epoch simulation.
//!
//! The canonical configuration lives in `epoch-config.yaml`. This module
//! defines strongly-typed structs that mirror the YAML structure, and
//! provides a loader that reads and validates the file. Every field has a
//! default, so an empty document is a valid configuration.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use epoch_events::EventBusConfig;
use serde::Deserialize;

/// Environment variable that overrides `world.seed`.
pub const SEED_ENV_VAR: &str = "EPOCH_SEED";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// An environment override could not be parsed.
    #[error("invalid value {value:?} for environment variable {variable}: {reason}")]
    InvalidOverride {
        /// The environment variable name.
        variable: &'static str,
        /// The rejected value.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// A value is out of its allowed range.
    #[error("invalid configuration: {field} {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: &'static str,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level simulation configuration.
///
/// Mirrors the structure of `epoch-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SimulationConfig {
    /// World-level settings.
    #[serde(default)]
    pub world: WorldConfig,

    /// The scenario the binary initializes.
    #[serde(default)]
    pub scenario: ScenarioConfig,

    /// Tick pacing, snapshots, and engine call bounds.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Event bus queue and worker pool.
    #[serde(default)]
    pub event_bus: EventBusConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SimulationConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// `EPOCH_SEED` overrides `world.seed`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, and
    /// [`ConfigError::InvalidOverride`] if `EPOCH_SEED` is not an integer.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yml::from_str(&contents)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yml::from_str(yaml)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOverride`] for unparsable values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOverride`] for unparsable values.
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(SEED_ENV_VAR) {
            let parsed = value.trim().parse::<u64>();
            self.world.seed = parsed.map_err(|err| ConfigError::InvalidOverride {
                variable: SEED_ENV_VAR,
                value,
                reason: err.to_string(),
            })?;
        }
        Ok(())
    }

    /// Reject values the core cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.time_per_tick()?;
        if self.scheduler.event_settle_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.event_settle_timeout_ms",
                reason: "must be at least 1",
            });
        }
        if self.event_bus.capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "event_bus.capacity",
                reason: "must be at least 1",
            });
        }
        if self.event_bus.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "event_bus.workers",
                reason: "must be at least 1",
            });
        }
        if self.scenario.id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "scenario.id",
                reason: "must not be empty",
            });
        }
        Ok(())
    }
}

/// World-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorldConfig {
    /// Global random seed for reproducibility.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
        }
    }
}

/// Scenario bound at initialize.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScenarioConfig {
    /// Scenario identifier.
    #[serde(default = "default_scenario_id")]
    pub id: String,

    /// Simulation time of tick 0.
    #[serde(default = "default_scenario_start")]
    pub start: DateTime<Utc>,

    /// Location descriptor.
    #[serde(default = "default_location")]
    pub location: String,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            id: default_scenario_id(),
            start: default_scenario_start(),
            location: default_location(),
        }
    }
}

/// Tick scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchedulerConfig {
    /// Real-time milliseconds between ticks (runtime-adjustable).
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Simulation seconds each tick advances the clock by.
    #[serde(default = "default_seconds_per_tick")]
    pub seconds_per_tick: u64,

    /// Capture a snapshot every N ticks (0 = never).
    #[serde(default = "default_snapshot_interval_ticks")]
    pub snapshot_interval_ticks: u64,

    /// Number of snapshots kept in memory for `jump`.
    #[serde(default = "default_snapshot_retention")]
    pub snapshot_retention: usize,

    /// Upper bound on a single engine call (0 = unbounded).
    #[serde(default = "default_engine_timeout_ms")]
    pub engine_timeout_ms: u64,

    /// Upper bound on waiting for event delivery to settle before and
    /// after each sweep. Always bounded.
    #[serde(default = "default_event_settle_timeout_ms")]
    pub event_settle_timeout_ms: u64,

    /// Stop the tick loop after this many ticks (0 = unlimited).
    #[serde(default)]
    pub max_ticks: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            seconds_per_tick: default_seconds_per_tick(),
            snapshot_interval_ticks: default_snapshot_interval_ticks(),
            snapshot_retention: default_snapshot_retention(),
            engine_timeout_ms: default_engine_timeout_ms(),
            event_settle_timeout_ms: default_event_settle_timeout_ms(),
            max_ticks: 0,
        }
    }
}

impl SchedulerConfig {
    /// Simulation time advanced per tick.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `seconds_per_tick` is zero or
    /// does not fit a [`TimeDelta`].
    pub fn time_per_tick(&self) -> Result<TimeDelta, ConfigError> {
        if self.seconds_per_tick == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.seconds_per_tick",
                reason: "must be at least 1",
            });
        }
        i64::try_from(self.seconds_per_tick)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or(ConfigError::Invalid {
                field: "scheduler.seconds_per_tick",
                reason: "is too large",
            })
    }

    /// Real-time pause between ticks.
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Per-call engine bound, if any.
    pub const fn engine_timeout(&self) -> Option<Duration> {
        if self.engine_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.engine_timeout_ms))
        }
    }

    /// Bound on waiting for the event bus to settle.
    pub const fn event_settle_timeout(&self) -> Duration {
        Duration::from_millis(self.event_settle_timeout_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions for serde
// ---------------------------------------------------------------------------

const fn default_seed() -> u64 {
    42
}

fn default_scenario_id() -> String {
    String::from("default")
}

fn default_scenario_start() -> DateTime<Utc> {
    // 2025-01-01T00:00:00Z
    DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
}

fn default_location() -> String {
    String::from("Cleveland, USA")
}

const fn default_tick_interval_ms() -> u64 {
    1_000
}

const fn default_seconds_per_tick() -> u64 {
    86_400
}

const fn default_snapshot_interval_ticks() -> u64 {
    10
}

const fn default_snapshot_retention() -> usize {
    32
}

const fn default_event_settle_timeout_ms() -> u64 {
    1_000
}

const fn default_engine_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    String::from("info")
}
