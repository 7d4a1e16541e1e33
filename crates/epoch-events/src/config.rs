//! Event bus configuration.

use serde::{Deserialize, Serialize};

/// What `publish` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Reject the event being published. The drop is counted silently.
    DropNewest,
    /// Evict the oldest queued event to make room, logging a warning.
    #[default]
    DropOldest,
    /// Wait up to `block_timeout_ms` for space, then drop the new event.
    Block,
}

/// Queue and worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Maximum number of events waiting in the queue.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Number of worker tasks draining the queue.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Overflow policy.
    #[serde(default)]
    pub backpressure: BackpressurePolicy,

    /// Upper bound on how long a publisher waits under
    /// [`BackpressurePolicy::Block`].
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,

    /// Number of delivered events kept for [`recent`](crate::EventBus::recent).
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            workers: default_workers(),
            backpressure: BackpressurePolicy::default(),
            block_timeout_ms: default_block_timeout_ms(),
            history_capacity: default_history_capacity(),
        }
    }
}

const fn default_capacity() -> usize {
    10_000
}

const fn default_workers() -> usize {
    4
}

const fn default_block_timeout_ms() -> u64 {
    5_000
}

const fn default_history_capacity() -> usize {
    1_000
}
