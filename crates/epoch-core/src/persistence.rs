//! Storage collaborator.
//!
//! The core performs no storage I/O. It hands compressed snapshot payloads
//! to an injected [`Persistence`] implementation and asks for them back on
//! restore.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Which stored payload to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSelector {
    /// The payload with the highest tick.
    Latest,
    /// The payload saved for exactly this tick.
    AtTick(u64),
}

impl core::fmt::Display for SnapshotSelector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::AtTick(tick) => write!(f, "tick {tick}"),
        }
    }
}

/// Errors reported by a persistence backend.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Nothing stored matches the selector.
    #[error("no stored snapshot for {selector}")]
    NotFound {
        /// The selector that matched nothing.
        selector: SnapshotSelector,
    },

    /// The backend failed.
    #[error("persistence backend error: {reason}")]
    Backend {
        /// Backend-specific description.
        reason: String,
    },
}

/// Stores and loads state payloads.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Store a payload captured at `tick_count`.
    async fn save(&self, blob: &[u8], tick_count: u64) -> Result<(), PersistenceError>;

    /// Load a stored payload.
    async fn load(&self, selector: SnapshotSelector) -> Result<Vec<u8>, PersistenceError>;
}

/// Keeps payloads in memory. Saving twice for one tick keeps the later one.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    blobs: RwLock<BTreeMap<u64, Vec<u8>>>,
}

impl InMemoryPersistence {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticks with a stored payload, oldest first.
    pub async fn ticks(&self) -> Vec<u64> {
        self.blobs.read().await.keys().copied().collect()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn save(&self, blob: &[u8], tick_count: u64) -> Result<(), PersistenceError> {
        self.blobs.write().await.insert(tick_count, blob.to_vec());
        Ok(())
    }

    async fn load(&self, selector: SnapshotSelector) -> Result<Vec<u8>, PersistenceError> {
        let blobs = self.blobs.read().await;
        let found = match selector {
            SnapshotSelector::Latest => blobs.values().next_back(),
            SnapshotSelector::AtTick(tick) => blobs.get(&tick),
        };
        found
            .cloned()
            .ok_or(PersistenceError::NotFound { selector })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_and_load() {
        let store = InMemoryPersistence::new();
        store.save(b"zero", 0).await.unwrap();
        store.save(b"ten", 10).await.unwrap();
        store.save(b"five", 5).await.unwrap();

        assert_eq!(store.load(SnapshotSelector::Latest).await.unwrap(), b"ten");
        assert_eq!(store.load(SnapshotSelector::AtTick(5)).await.unwrap(), b"five");
        assert_eq!(store.ticks().await, vec![0, 5, 10]);
    }

    #[tokio::test]
    async fn missing_payloads_are_not_found() {
        let store = InMemoryPersistence::new();
        assert!(matches!(
            store.load(SnapshotSelector::Latest).await,
            Err(PersistenceError::NotFound {
                selector: SnapshotSelector::Latest
            })
        ));
        store.save(b"x", 1).await.unwrap();
        assert!(store.load(SnapshotSelector::AtTick(2)).await.is_err());
    }
}
