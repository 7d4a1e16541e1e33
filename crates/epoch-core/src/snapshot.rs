//! Compressed world-state captures and the bounded snapshot history.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use epoch_types::TimelineId;

use crate::migration::MigrationRegistry;
use crate::state::{StateError, WorldState};

/// An immutable, zstd-compressed capture of a [`WorldState`].
///
/// Cloning is cheap; the compressed bytes are shared.
#[derive(Debug, Clone)]
pub struct Snapshot {
    tick: u64,
    current_time: DateTime<Utc>,
    timeline_id: TimelineId,
    compressed: Arc<[u8]>,
}

impl Snapshot {
    /// Capture `state` at its current tick.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Serialization`] or [`StateError::Compression`].
    pub fn capture(state: &WorldState) -> Result<Self, StateError> {
        Ok(Self {
            tick: state.tick_count(),
            current_time: state.current_time(),
            timeline_id: state.timeline_id(),
            compressed: state.to_compressed()?.into(),
        })
    }

    /// Rebuild the captured state, migrating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the bytes are corrupt or unmigratable.
    pub fn restore(&self, migrations: &MigrationRegistry) -> Result<WorldState, StateError> {
        WorldState::from_compressed(&self.compressed, migrations)
    }

    /// Tick the capture was taken at.
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Simulation time at capture.
    pub const fn current_time(&self) -> DateTime<Utc> {
        self.current_time
    }

    /// Timeline of the captured state.
    pub const fn timeline_id(&self) -> TimelineId {
        self.timeline_id
    }

    /// The compressed payload handed to persistence.
    pub fn as_bytes(&self) -> &[u8] {
        &self.compressed
    }
}

/// Recent snapshots kept in memory, keyed by tick.
#[derive(Debug, Clone)]
pub struct SnapshotHistory {
    retention: usize,
    entries: BTreeMap<u64, Snapshot>,
}

impl SnapshotHistory {
    /// A history that keeps at most `retention` snapshots (minimum 1).
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            entries: BTreeMap::new(),
        }
    }

    /// Add a snapshot, evicting the oldest beyond the retention limit.
    /// A snapshot at an existing tick replaces it.
    pub fn push(&mut self, snapshot: Snapshot) {
        self.entries.insert(snapshot.tick, snapshot);
        while self.entries.len() > self.retention {
            self.entries.pop_first();
        }
    }

    /// The most recent snapshot.
    pub fn latest(&self) -> Option<&Snapshot> {
        self.entries.values().next_back()
    }

    /// The snapshot taken at exactly `tick`.
    pub fn at_tick(&self, tick: u64) -> Option<&Snapshot> {
        self.entries.get(&tick)
    }

    /// The most recent snapshot whose simulation time is at or before `time`.
    pub fn latest_at_or_before(&self, time: DateTime<Utc>) -> Option<&Snapshot> {
        self.entries
            .values()
            .rev()
            .find(|snapshot| snapshot.current_time <= time)
    }

    /// Drop every snapshot taken after `tick`.
    pub fn truncate_after(&mut self, tick: u64) {
        if let Some(first_dropped) = tick.checked_add(1) {
            drop(self.entries.split_off(&first_dropped));
        }
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of retained snapshots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Retained ticks, oldest first.
    pub fn ticks(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.keys().copied()
    }
}
