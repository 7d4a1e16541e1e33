//! Event envelope and subscription topics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An immutable message routed through the bus.
///
/// Events are created by [`EventBus::publish`](crate::EventBus::publish)
/// and shared with handlers behind an [`Arc`](std::sync::Arc), so nothing
/// can change them after publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Bus-wide sequence number, assigned in publish order.
    pub sequence: u64,
    /// Type tag used for routing, e.g. `"population.changed"`.
    pub event_type: String,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// When the event was published. Wall-clock on the bus; events handed
    /// to engines from a world's pending queue carry simulation time.
    pub published_at: DateTime<Utc>,
}

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every event, regardless of type.
    All,
    /// Events whose type tag equals this string.
    Type(String),
}

impl Topic {
    /// The type string that subscribes to every event.
    pub const WILDCARD: &'static str = "*";
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        if value == Self::WILDCARD {
            Self::All
        } else {
            Self::Type(value.to_owned())
        }
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        if value == Self::WILDCARD {
            Self::All
        } else {
            Self::Type(value)
        }
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::All => f.write_str(Self::WILDCARD),
            Self::Type(event_type) => f.write_str(event_type),
        }
    }
}
