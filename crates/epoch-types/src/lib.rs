//! Shared type definitions for the Epoch simulation core.
//!
//! Identifiers that cross crate boundaries live here so the event bus,
//! the core and any collaborator (persistence, transport) agree on their
//! serialized form.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe wrappers for timeline, scenario and location
//!   identifiers

pub mod ids;

pub use ids::{Location, ScenarioId, TimelineId};
