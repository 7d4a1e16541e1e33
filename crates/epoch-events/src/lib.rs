//! Asynchronous publish/subscribe event bus for the Epoch simulation core.
//!
//! Engines never call each other directly. Cross-engine communication goes
//! through the [`EventBus`]: publishers enqueue immutable [`Event`]s on a
//! bounded queue, and a fixed pool of worker tasks drains the queue and
//! invokes every matching [`EventHandler`].
//!
//! # Modules
//!
//! - [`bus`] -- The [`EventBus`], publish outcomes, and running counters.
//! - [`config`] -- Queue capacity, worker count, and the
//!   [`BackpressurePolicy`] applied on overflow.
//! - [`event`] -- The [`Event`] envelope and subscription [`Topic`]s.
//! - [`handler`] -- The [`EventHandler`] trait and [`HandlerError`].

pub mod bus;
pub mod config;
pub mod event;
pub mod handler;

pub use bus::{BusStats, EventBus, PublishOutcome, SubscriptionId};
pub use config::{BackpressurePolicy, EventBusConfig};
pub use event::{Event, Topic};
pub use handler::{EventHandler, FnHandler, HandlerError};
