//! The engine capability contract.
//!
//! Every domain engine (population, economy, geography, ...) implements
//! [`Engine`] and is driven exclusively by the orchestrator. Engines never
//! see each other's concrete types. They read other engines' published
//! slices and exchange events through the [`EngineContext`], which is also
//! the only way to write their own slice.
//!
//! Writes made through a context are staged and committed only when the
//! engine call returns `Ok`, so a failing call leaves its slice unchanged.
//! Simulation-relevant data belongs in the slice: restoring a snapshot or
//! jumping in time rewinds slices, not an engine's private fields.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use epoch_events::{Event, EventBus, PublishOutcome};
use epoch_types::{Location, ScenarioId};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::state::WorldState;

/// Errors returned by engine calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The engine reported a failure.
    #[error("{reason}")]
    Failed {
        /// Engine-specific description.
        reason: String,
    },

    /// The call exceeded the configured engine timeout.
    #[error("call timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout that expired.
        timeout_ms: u64,
    },

    /// The engine's slice could not be encoded or decoded.
    #[error("state slice error: {reason}")]
    State {
        /// The underlying serde message.
        reason: String,
    },
}

impl EngineError {
    /// Shorthand for [`EngineError::Failed`].
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(source: serde_json::Error) -> Self {
        Self::State {
            reason: source.to_string(),
        }
    }
}

/// An engine call that failed during a sweep, shutdown, or initialize.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("engine {engine:?} failed at tick {tick}: {error}")]
pub struct EngineFailure {
    /// Engine name.
    pub engine: String,
    /// Tick during which the call failed.
    pub tick: u64,
    /// Whether the engine is flagged critical.
    pub critical: bool,
    /// What went wrong.
    pub error: EngineError,
}

/// The capability contract every domain engine implements.
#[async_trait]
pub trait Engine: Send {
    /// Unique engine name. Also the key of the engine's state slice.
    fn name(&self) -> &str;

    /// Ordering hint. Lower runs earlier among engines whose dependencies
    /// are satisfied.
    fn priority(&self) -> i32 {
        0
    }

    /// Names of engines that must run before this one.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// A failing critical engine halts the simulation.
    fn is_critical(&self) -> bool {
        false
    }

    /// Slice returned by reads before the engine writes one.
    fn default_state(&self) -> Value {
        Value::Null
    }

    /// Event types (or `"*"`) delivered to [`handle_event`](Self::handle_event).
    fn subscriptions(&self) -> Vec<String> {
        Vec::new()
    }

    /// Called once, in execution order, when a world is bound. Restored
    /// worlds already carry the engine's slice.
    async fn initialize(&mut self, ctx: &mut EngineContext<'_>) -> Result<(), EngineError>;

    /// Advance the engine by one tick of `delta` simulation time.
    async fn tick(&mut self, ctx: &mut EngineContext<'_>, delta: TimeDelta)
    -> Result<(), EngineError>;

    /// Called in reverse execution order when the simulation stops.
    async fn shutdown(&mut self, ctx: &mut EngineContext<'_>) -> Result<(), EngineError> {
        let _ = ctx;
        Ok(())
    }

    /// Receives subscribed events queued since the previous tick, in
    /// publish order, immediately before [`tick`](Self::tick).
    ///
    /// The queue lives in the world state, so a restored world delivers
    /// exactly what the original would have. `sequence` is the event's
    /// position in this tick's inbox and `published_at` is the simulation
    /// time of the tick that published it.
    async fn handle_event(
        &mut self,
        ctx: &mut EngineContext<'_>,
        event: &Event,
    ) -> Result<(), EngineError> {
        let _ = (ctx, event);
        Ok(())
    }
}

/// An engine's view of the world during one call.
pub struct EngineContext<'a> {
    engine: &'a str,
    state: &'a mut WorldState,
    bus: &'a EventBus,
    staged: Option<Value>,
}

impl<'a> EngineContext<'a> {
    /// A context for `engine` over `state`.
    pub const fn new(engine: &'a str, state: &'a mut WorldState, bus: &'a EventBus) -> Self {
        Self {
            engine,
            state,
            bus,
            staged: None,
        }
    }

    /// The engine this context belongs to.
    pub const fn engine_name(&self) -> &str {
        self.engine
    }

    /// Completed ticks, including the one in progress.
    pub const fn tick_count(&self) -> u64 {
        self.state.tick_count()
    }

    /// Current simulation time.
    pub const fn current_time(&self) -> DateTime<Utc> {
        self.state.current_time()
    }

    /// Scenario of the bound world.
    pub const fn scenario_id(&self) -> &ScenarioId {
        self.state.scenario_id()
    }

    /// Location of the bound world.
    pub const fn location(&self) -> &Location {
        self.state.location()
    }

    /// Another engine's committed slice, or this engine's staged slice.
    pub fn state_of(&self, engine: &str) -> &Value {
        if engine == self.engine {
            return self.own_state();
        }
        self.state.get_engine_state(engine)
    }

    /// This engine's slice, including staged writes.
    pub fn own_state(&self) -> &Value {
        match &self.staged {
            Some(staged) => staged,
            None => self.state.get_engine_state(self.engine),
        }
    }

    /// Whether this engine has written a slice, staged or committed.
    /// Declared defaults do not count, so a restored world reports `true`.
    pub fn has_own_state(&self) -> bool {
        self.staged.is_some() || self.state.has_engine_state(self.engine)
    }

    /// Decode this engine's slice. `null` decodes to `None`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::State`] if the slice does not match `T`.
    pub fn own_state_as<T: DeserializeOwned>(&self) -> Result<Option<T>, EngineError> {
        let value = self.own_state();
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(T::deserialize(value)?))
    }

    /// Stage a replacement for this engine's slice.
    pub fn set_own_state(&mut self, blob: Value) {
        self.staged = Some(blob);
    }

    /// Encode and stage a replacement for this engine's slice.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::State`] if `value` cannot be encoded.
    pub fn set_own_state_from<T: Serialize>(&mut self, value: &T) -> Result<(), EngineError> {
        self.staged = Some(serde_json::to_value(value)?);
        Ok(())
    }

    /// This engine's random stream `stream`, namespaced as
    /// `"<engine>/<stream>"` so engines cannot disturb each other's draws.
    pub fn rng(&mut self, stream: &str) -> &mut ChaCha8Rng {
        let key = format!("{}/{stream}", self.engine);
        self.state.random_mut().get_rng(&key)
    }

    /// Publish an event on the bus.
    pub async fn publish(
        &self,
        event_type: impl Into<String> + Send,
        payload: Value,
    ) -> PublishOutcome {
        self.bus.publish(event_type, payload).await
    }

    /// Write the staged slice, if any, into the world.
    pub fn commit(self) {
        if let Some(blob) = self.staged {
            self.state.set_engine_state(self.engine, blob);
        }
    }
}
