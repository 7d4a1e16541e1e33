//! Stepwise schema migrations for stored world state.
//!
//! Stored documents carry a `schema_version`. On load, the
//! [`MigrationRegistry`] walks the raw JSON document forward one version at
//! a time until it reaches the version the running code understands. A
//! missing step, or a document from a newer build, fails the load without
//! touching any live state.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::rng::DeterministicRandom;
use crate::state::{WORLD_STATE_SCHEMA_VERSION, initial_timeline_id};

/// A stored document cannot be brought to the running schema version.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// The document comes from a newer build.
    #[error("stored schema version {found} is newer than supported version {supported}")]
    Newer {
        /// Version found in the document.
        found: u32,
        /// Highest version this build understands.
        supported: u32,
    },

    /// No step is registered for some version on the way to the target.
    #[error("no migration path from schema version {from} to {to}")]
    NoMigrationPath {
        /// The version with no outgoing step.
        from: u32,
        /// The target version.
        to: u32,
    },

    /// The document is not shaped like a world state.
    #[error("malformed state document: {reason}")]
    Malformed {
        /// What was wrong.
        reason: String,
    },

    /// A migration step rejected the document.
    #[error("migration from schema version {from} failed: {reason}")]
    StepFailed {
        /// Source version of the failing step.
        from: u32,
        /// What went wrong.
        reason: String,
    },
}

/// One `v -> v + 1` transformation over the raw document.
pub type MigrationStep = Box<dyn Fn(&mut Value) -> Result<(), SchemaError> + Send + Sync>;

/// Ordered single-step migrations up to a target version.
pub struct MigrationRegistry {
    target: u32,
    steps: BTreeMap<u32, MigrationStep>,
}

impl MigrationRegistry {
    /// An empty registry targeting `target`.
    pub fn new(target: u32) -> Self {
        Self {
            target,
            steps: BTreeMap::new(),
        }
    }

    /// Register the step that upgrades documents at version `from`.
    /// A later registration for the same version replaces the earlier one.
    pub fn register(
        &mut self,
        from: u32,
        step: impl Fn(&mut Value) -> Result<(), SchemaError> + Send + Sync + 'static,
    ) {
        self.steps.insert(from, Box::new(step));
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with_step(
        mut self,
        from: u32,
        step: impl Fn(&mut Value) -> Result<(), SchemaError> + Send + Sync + 'static,
    ) -> Self {
        self.register(from, step);
        self
    }

    /// Builder that changes the target version.
    #[must_use]
    pub const fn with_target(mut self, target: u32) -> Self {
        self.target = target;
        self
    }

    /// The version documents are migrated to.
    pub const fn target_version(&self) -> u32 {
        self.target
    }

    /// Bring `document` up to the target version in place.
    ///
    /// Returns the version the document was stored at.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Newer`] for documents above the target,
    /// [`SchemaError::NoMigrationPath`] when a step is missing, and the
    /// step's own error if a step fails.
    pub fn migrate(&self, document: &mut Value) -> Result<u32, SchemaError> {
        let stored = stored_version(document)?;
        if stored > self.target {
            return Err(SchemaError::Newer {
                found: stored,
                supported: self.target,
            });
        }

        let mut version = stored;
        while version < self.target {
            let step = self
                .steps
                .get(&version)
                .ok_or(SchemaError::NoMigrationPath {
                    from: version,
                    to: self.target,
                })?;
            step(document)?;
            version = version.saturating_add(1);
            object_mut(document)?.insert("schema_version".to_owned(), Value::from(version));
            debug!(from = version.saturating_sub(1), to = version, "Applied state migration");
        }
        Ok(stored)
    }
}

impl Default for MigrationRegistry {
    /// The running code's version with every built-in step.
    fn default() -> Self {
        Self::new(WORLD_STATE_SCHEMA_VERSION).with_step(0, upgrade_v0)
    }
}

impl core::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MigrationRegistry")
            .field("target", &self.target)
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn stored_version(document: &Value) -> Result<u32, SchemaError> {
    let Some(object) = document.as_object() else {
        return Err(SchemaError::Malformed {
            reason: String::from("expected a JSON object"),
        });
    };
    match object.get("schema_version") {
        None => Ok(0),
        Some(value) => value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| SchemaError::Malformed {
                reason: format!("schema_version is not a valid version: {value}"),
            }),
    }
}

fn object_mut(document: &mut Value) -> Result<&mut serde_json::Map<String, Value>, SchemaError> {
    document.as_object_mut().ok_or_else(|| SchemaError::Malformed {
        reason: String::from("expected a JSON object"),
    })
}

/// Version 0 stored the location as `current_location`, kept the seed as a
/// top-level field, had no timeline identity, and did not persist
/// generator state.
fn upgrade_v0(document: &mut Value) -> Result<(), SchemaError> {
    let object = object_mut(document)?;

    if let Some(location) = object.remove("current_location") {
        object.entry("location").or_insert(location);
    }

    let seed = match object.remove("seed") {
        None => 0,
        Some(value) => value.as_u64().ok_or_else(|| SchemaError::StepFailed {
            from: 0,
            reason: format!("seed is not an unsigned integer: {value}"),
        })?,
    };

    if !object.contains_key("timeline_id") {
        let scenario = object
            .get("scenario_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let timeline = initial_timeline_id(seed, scenario);
        object.insert("timeline_id".to_owned(), Value::String(timeline.to_string()));
    }

    if !object.contains_key("random") {
        let random = serde_json::to_value(DeterministicRandom::new(seed).export_state())
            .map_err(|err| SchemaError::StepFailed {
                from: 0,
                reason: err.to_string(),
            })?;
        object.insert("random".to_owned(), random);
    }

    object.entry("engine_states").or_insert_with(|| Value::Object(serde_json::Map::new()));
    Ok(())
}
