//! Deterministic orchestration core for the Epoch world simulation.
//!
//! The core binds independent domain engines to one shared, versioned
//! [`WorldState`] and drives them through discrete ticks. Given the same
//! seed, scenario, and engines, two runs produce byte-identical state.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `epoch-config.yaml` into
//!   strongly-typed structs.
//! - [`engine`] -- The [`Engine`] capability contract and the
//!   [`EngineContext`] engines receive on every call.
//! - [`metrics`] -- The [`MetricsSink`] observability collaborator.
//! - [`migration`] -- Stepwise schema migrations for stored state.
//! - [`orchestrator`] -- Registration, lifecycle, and the per-tick sweep.
//! - [`persistence`] -- The [`Persistence`] storage collaborator.
//! - [`registry`] -- Deterministic execution-order resolution.
//! - [`rng`] -- Seeded, forkable random streams.
//! - [`scheduler`] -- The [`TickScheduler`] state machine and tick loop.
//! - [`snapshot`] -- Compressed state captures and the in-memory history.
//! - [`state`] -- The [`WorldState`] container and state diffs.
//!
//! [`Engine`]: engine::Engine
//! [`EngineContext`]: engine::EngineContext
//! [`MetricsSink`]: metrics::MetricsSink
//! [`Persistence`]: persistence::Persistence
//! [`TickScheduler`]: scheduler::TickScheduler
//! [`WorldState`]: state::WorldState

pub mod config;
pub mod engine;
pub mod metrics;
pub mod migration;
pub mod orchestrator;
pub mod persistence;
pub mod registry;
pub mod rng;
pub mod scheduler;
pub mod snapshot;
pub mod state;

pub use config::{ConfigError, SimulationConfig};
pub use engine::{Engine, EngineContext, EngineError, EngineFailure};
pub use metrics::{InMemoryMetrics, MetricsSink, MetricsSummary, NoopMetrics};
pub use migration::{MigrationRegistry, SchemaError};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use persistence::{InMemoryPersistence, Persistence, PersistenceError, SnapshotSelector};
pub use rng::DeterministicRandom;
pub use scheduler::{
    JumpReport, RunEnd, RunSummary, SchedulerError, SchedulerStatus, SweepReport, TickScheduler,
};
pub use snapshot::Snapshot;
pub use state::{PendingEvent, StateDiff, StateError, WorldState};
