//! The canonical world state container and state diffs.
//!
//! A [`WorldState`] holds the global clock, the tick counter, the scenario
//! binding, one opaque JSON slice per engine, and the events each engine
//! has yet to handle. Engine slices are replaced wholesale, never merged. All maps are ordered, so the JSON
//! encoding of a state is canonical: equal states serialize to identical
//! bytes.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, TimeDelta, Utc};
use epoch_types::{Location, ScenarioId, TimelineId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::migration::{MigrationRegistry, SchemaError};
use crate::rng::{DeterministicRandom, RandomError, RandomState};

/// Schema version written by this build.
pub const WORLD_STATE_SCHEMA_VERSION: u32 = 1;

const ZSTD_LEVEL: i32 = 3;

static NULL_STATE: Value = Value::Null;

/// Errors from encoding, decoding, or advancing world state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The state could not be encoded.
    #[error("failed to serialize world state: {source}")]
    Serialization {
        /// The underlying JSON error.
        source: serde_json::Error,
    },

    /// The stored bytes are not a valid world state.
    #[error("failed to deserialize world state: {source}")]
    Deserialization {
        /// The underlying JSON error.
        source: serde_json::Error,
    },

    /// Compressed bytes could not be encoded or decoded.
    #[error("snapshot compression failed: {source}")]
    Compression {
        /// The underlying I/O error from zstd.
        source: std::io::Error,
    },

    /// No migration path to the running schema version.
    #[error("schema error: {source}")]
    Schema {
        /// The underlying schema error.
        #[from]
        source: SchemaError,
    },

    /// Stored generator state is invalid.
    #[error("random state error: {source}")]
    Random {
        /// The underlying generator error.
        #[from]
        source: RandomError,
    },

    /// Advancing the clock would overflow.
    #[error("simulation clock overflow at tick {tick}")]
    ClockOverflow {
        /// Tick at which the overflow happened.
        tick: u64,
    },

    /// A diff was applied to a state it was not taken from.
    #[error("diff expects base tick {expected}, state is at tick {found}")]
    DiffBaseMismatch {
        /// The diff's base tick.
        expected: u64,
        /// The state's tick.
        found: u64,
    },

    /// An engine slice does not match the requested type.
    #[error("engine state {engine:?} has an unexpected shape: {source}")]
    EngineSlice {
        /// Engine name.
        engine: String,
        /// The underlying JSON error.
        source: serde_json::Error,
    },
}

/// Global clock, scenario binding, and per-engine state slices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldState {
    schema_version: u32,
    current_time: DateTime<Utc>,
    tick_count: u64,
    scenario_id: ScenarioId,
    timeline_id: TimelineId,
    #[serde(default)]
    parent_timeline: Option<TimelineId>,
    location: Location,
    #[serde(default)]
    engine_states: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pending_events: BTreeMap<String, Vec<PendingEvent>>,
    random: DeterministicRandom,
    #[serde(skip)]
    defaults: BTreeMap<String, Value>,
    #[serde(skip)]
    dirty: BTreeSet<String>,
}

impl WorldState {
    /// A fresh state at tick 0, with generators seeded from `seed`.
    pub fn new(
        scenario_id: ScenarioId,
        initial_time: DateTime<Utc>,
        location: Location,
        seed: u64,
    ) -> Self {
        let timeline_id = initial_timeline_id(seed, scenario_id.as_str());
        Self {
            schema_version: WORLD_STATE_SCHEMA_VERSION,
            current_time: initial_time,
            tick_count: 0,
            scenario_id,
            timeline_id,
            parent_timeline: None,
            location,
            engine_states: BTreeMap::new(),
            pending_events: BTreeMap::new(),
            random: DeterministicRandom::new(seed),
            defaults: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Schema version of this state.
    pub const fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Current simulation time.
    pub const fn current_time(&self) -> DateTime<Utc> {
        self.current_time
    }

    /// Number of completed ticks.
    pub const fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Scenario this state belongs to.
    pub const fn scenario_id(&self) -> &ScenarioId {
        &self.scenario_id
    }

    /// Branch this state belongs to.
    pub const fn timeline_id(&self) -> TimelineId {
        self.timeline_id
    }

    /// Branch this state was forked from, if any.
    pub const fn parent_timeline(&self) -> Option<TimelineId> {
        self.parent_timeline
    }

    /// Location descriptor.
    pub const fn location(&self) -> &Location {
        &self.location
    }

    /// Global seed the generators were created with.
    pub const fn seed(&self) -> u64 {
        self.random.seed()
    }

    /// Random generators.
    pub const fn random(&self) -> &DeterministicRandom {
        &self.random
    }

    /// Mutable random generators.
    pub const fn random_mut(&mut self) -> &mut DeterministicRandom {
        &mut self.random
    }

    // -----------------------------------------------------------------------
    // Engine slices
    // -----------------------------------------------------------------------

    /// An engine's slice, its registered default, or `null`.
    pub fn get_engine_state(&self, name: &str) -> &Value {
        self.engine_states
            .get(name)
            .or_else(|| self.defaults.get(name))
            .unwrap_or(&NULL_STATE)
    }

    /// Whether the engine has a stored slice.
    pub fn has_engine_state(&self, name: &str) -> bool {
        self.engine_states.contains_key(name)
    }

    /// Names of engines with a stored slice.
    pub fn engine_names(&self) -> impl Iterator<Item = &str> {
        self.engine_states.keys().map(String::as_str)
    }

    /// Replace an engine's slice and mark it dirty.
    pub fn set_engine_state(&mut self, name: impl Into<String>, blob: Value) {
        let name = name.into();
        self.dirty.insert(name.clone());
        self.engine_states.insert(name, blob);
    }

    /// Remove an engine's slice. Returns the removed value.
    pub fn remove_engine_state(&mut self, name: &str) -> Option<Value> {
        let removed = self.engine_states.remove(name);
        if removed.is_some() {
            self.dirty.insert(name.to_owned());
        }
        removed
    }

    /// Decode an engine's slice. `null` decodes to `None`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::EngineSlice`] if the slice does not match `T`.
    pub fn engine_state_as<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StateError> {
        let value = self.get_engine_state(name);
        if value.is_null() {
            return Ok(None);
        }
        T::deserialize(value)
            .map(Some)
            .map_err(|source| StateError::EngineSlice {
                engine: name.to_owned(),
                source,
            })
    }

    /// Encode `value` and store it as the engine's slice.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::EngineSlice`] if `value` cannot be encoded.
    pub fn set_engine_state_from<T: Serialize>(
        &mut self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<(), StateError> {
        let name = name.into();
        let blob = serde_json::to_value(value).map_err(|source| StateError::EngineSlice {
            engine: name.clone(),
            source,
        })?;
        self.set_engine_state(name, blob);
        Ok(())
    }

    /// Record the slice an engine starts from. Defaults are not serialized.
    pub fn register_default(&mut self, name: impl Into<String>, blob: Value) {
        self.defaults.insert(name.into(), blob);
    }

    // -----------------------------------------------------------------------
    // Pending events
    // -----------------------------------------------------------------------

    /// Append events to an engine's queue, after anything already waiting.
    pub fn queue_events(
        &mut self,
        engine: impl Into<String>,
        events: impl IntoIterator<Item = PendingEvent>,
    ) {
        let mut events = events.into_iter().peekable();
        if events.peek().is_none() {
            return;
        }
        self.pending_events
            .entry(engine.into())
            .or_default()
            .extend(events);
    }

    /// Remove and return an engine's queued events, oldest first.
    pub fn take_events(&mut self, engine: &str) -> Vec<PendingEvent> {
        self.pending_events.remove(engine).unwrap_or_default()
    }

    /// Events queued for an engine, oldest first.
    pub fn pending_events(&self, engine: &str) -> &[PendingEvent] {
        self.pending_events
            .get(engine)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Number of queued events across all engines.
    pub fn pending_event_count(&self) -> usize {
        self.pending_events.values().map(Vec::len).sum()
    }

    // -----------------------------------------------------------------------
    // Dirty tracking
    // -----------------------------------------------------------------------

    /// Whether any slice changed since the last [`clear_dirty`](Self::clear_dirty).
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Slices changed since the last [`clear_dirty`](Self::clear_dirty).
    pub fn dirty_engines(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    /// Forget recorded changes.
    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    // -----------------------------------------------------------------------
    // Clock and branching
    // -----------------------------------------------------------------------

    /// Advance the clock by `delta` and count one tick.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::ClockOverflow`] if either the calendar or the
    /// tick counter would overflow. The state is unchanged on error.
    pub fn advance_tick(&mut self, delta: TimeDelta) -> Result<(), StateError> {
        let overflow = StateError::ClockOverflow {
            tick: self.tick_count,
        };
        let time = self.current_time.checked_add_signed(delta);
        let tick = self.tick_count.checked_add(1);
        let (Some(time), Some(tick)) = (time, tick) else {
            return Err(overflow);
        };
        self.current_time = time;
        self.tick_count = tick;
        Ok(())
    }

    /// A divergent copy on a new timeline.
    ///
    /// The copy keeps every slice and duplicates the generator state, so
    /// the two states evolve independently from here on.
    #[must_use]
    pub fn fork(&self, label: &str) -> Self {
        let mut forked = self.clone();
        forked.timeline_id = fork_timeline_id(self.timeline_id, self.tick_count, label);
        forked.parent_timeline = Some(self.timeline_id);
        forked.random = self.random.fork();
        forked.dirty.clear();
        forked
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    /// Canonical JSON encoding.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Serialization`] if a slice cannot be encoded.
    pub fn serialize(&self) -> Result<Vec<u8>, StateError> {
        serde_json::to_vec(self).map_err(|source| StateError::Serialization { source })
    }

    /// Decode a state, migrating it to the registry's target version first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Deserialization`] for invalid JSON or shape,
    /// and [`StateError::Schema`] when no migration path exists.
    pub fn deserialize(bytes: &[u8], migrations: &MigrationRegistry) -> Result<Self, StateError> {
        let mut document: Value = serde_json::from_slice(bytes)
            .map_err(|source| StateError::Deserialization { source })?;
        migrations.migrate(&mut document)?;
        serde_json::from_value(document).map_err(|source| StateError::Deserialization { source })
    }

    /// zstd-compressed canonical encoding.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Serialization`] or [`StateError::Compression`].
    pub fn to_compressed(&self) -> Result<Vec<u8>, StateError> {
        let raw = self.serialize()?;
        zstd::encode_all(raw.as_slice(), ZSTD_LEVEL)
            .map_err(|source| StateError::Compression { source })
    }

    /// Decode bytes produced by [`to_compressed`](Self::to_compressed).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Compression`] for corrupt input, otherwise as
    /// [`deserialize`](Self::deserialize).
    pub fn from_compressed(
        bytes: &[u8],
        migrations: &MigrationRegistry,
    ) -> Result<Self, StateError> {
        let raw = zstd::decode_all(bytes).map_err(|source| StateError::Compression { source })?;
        Self::deserialize(&raw, migrations)
    }

    // -----------------------------------------------------------------------
    // Diffs
    // -----------------------------------------------------------------------

    /// The delta that turns `previous` into `self`.
    pub fn diff(&self, previous: &Self) -> StateDiff {
        let changed = self
            .engine_states
            .iter()
            .filter(|(name, value)| previous.engine_states.get(*name) != Some(*value))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let removed = previous
            .engine_states
            .keys()
            .filter(|name| !self.engine_states.contains_key(*name))
            .cloned()
            .collect();
        let random = self.random.export_state();

        StateDiff {
            base_tick: previous.tick_count,
            tick_count: self.tick_count,
            current_time: self.current_time,
            schema_version: (self.schema_version != previous.schema_version)
                .then_some(self.schema_version),
            scenario_id: (self.scenario_id != previous.scenario_id)
                .then(|| self.scenario_id.clone()),
            location: (self.location != previous.location).then(|| self.location.clone()),
            timeline: (self.timeline_id != previous.timeline_id
                || self.parent_timeline != previous.parent_timeline)
                .then_some(TimelineChange {
                    timeline_id: self.timeline_id,
                    parent_timeline: self.parent_timeline,
                }),
            pending_events: (self.pending_events != previous.pending_events)
                .then(|| self.pending_events.clone()),
            changed,
            removed,
            random: (random != previous.random.export_state()).then_some(random),
        }
    }

    /// Apply a diff taken against a state at this state's tick.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::DiffBaseMismatch`] if the diff was taken
    /// against a different tick, or [`StateError::Random`] if its generator
    /// state is invalid. The state is unchanged on error.
    pub fn apply_diff(&mut self, diff: &StateDiff) -> Result<(), StateError> {
        if diff.base_tick != self.tick_count {
            return Err(StateError::DiffBaseMismatch {
                expected: diff.base_tick,
                found: self.tick_count,
            });
        }
        let random = diff
            .random
            .as_ref()
            .map(DeterministicRandom::import_state)
            .transpose()?;

        self.tick_count = diff.tick_count;
        self.current_time = diff.current_time;
        if let Some(version) = diff.schema_version {
            self.schema_version = version;
        }
        if let Some(scenario) = &diff.scenario_id {
            self.scenario_id = scenario.clone();
        }
        if let Some(location) = &diff.location {
            self.location = location.clone();
        }
        if let Some(timeline) = diff.timeline {
            self.timeline_id = timeline.timeline_id;
            self.parent_timeline = timeline.parent_timeline;
        }
        if let Some(pending) = &diff.pending_events {
            self.pending_events = pending.clone();
        }
        for name in &diff.removed {
            self.remove_engine_state(name);
        }
        for (name, value) in &diff.changed {
            self.set_engine_state(name.clone(), value.clone());
        }
        if let Some(random) = random {
            self.random = random;
        }
        Ok(())
    }
}

/// Minimal delta between two states, for incremental persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDiff {
    /// Tick of the state the diff applies to.
    pub base_tick: u64,
    /// Tick after applying.
    pub tick_count: u64,
    /// Clock after applying.
    pub current_time: DateTime<Utc>,
    /// New schema version, if changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
    /// New scenario, if changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<ScenarioId>,
    /// New location, if changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// New timeline identity, if changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<TimelineChange>,
    /// Full pending event queues, if they changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_events: Option<BTreeMap<String, Vec<PendingEvent>>>,
    /// Slices added or replaced.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub changed: BTreeMap<String, Value>,
    /// Slices removed.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub removed: BTreeSet<String>,
    /// New generator state, if any draw happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random: Option<RandomState>,
}

impl StateDiff {
    /// Whether the diff only advances the clock.
    pub fn is_clock_only(&self) -> bool {
        self.changed.is_empty()
            && self.removed.is_empty()
            && self.random.is_none()
            && self.schema_version.is_none()
            && self.scenario_id.is_none()
            && self.location.is_none()
            && self.timeline.is_none()
            && self.pending_events.is_none()
    }
}

/// An event published during a tick and not yet handled by a subscriber.
///
/// Carries no bus sequence or wall-clock stamp, so queued events encode
/// the same way on every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    /// Event type the subscriber registered for.
    pub event_type: String,
    /// Event body.
    pub payload: Value,
    /// Simulation time at the end of the tick that published it.
    pub queued_at: DateTime<Utc>,
}

/// Timeline identity carried by a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineChange {
    /// New timeline id.
    pub timeline_id: TimelineId,
    /// New parent timeline.
    pub parent_timeline: Option<TimelineId>,
}

pub(crate) fn initial_timeline_id(seed: u64, scenario: &str) -> TimelineId {
    let mut hasher = Sha256::new();
    hasher.update(b"epoch/timeline/root");
    hasher.update(seed.to_le_bytes());
    hasher.update(scenario.as_bytes());
    timeline_from_digest(&hasher.finalize())
}

fn fork_timeline_id(parent: TimelineId, tick: u64, label: &str) -> TimelineId {
    let mut hasher = Sha256::new();
    hasher.update(b"epoch/timeline/fork");
    hasher.update(parent.into_inner().as_bytes());
    hasher.update(tick.to_le_bytes());
    hasher.update(label.as_bytes());
    timeline_from_digest(&hasher.finalize())
}

fn timeline_from_digest(digest: &[u8]) -> TimelineId {
    let mut bytes = [0_u8; 16];
    for (dst, src) in bytes.iter_mut().zip(digest) {
        *dst = *src;
    }
    TimelineId::from_random_bytes(bytes)
}
