//! Snapshot-persistence port.
//!
//! The store only requires an in-memory view; a collaborator may persist
//! entries by implementing [`CacheSnapshotStore`] and wiring it in via
//! [`crate::store::CacheStore::with_snapshot_store`]. No storage medium is
//! mandated.

use async_trait::async_trait;

use crate::entry::CacheEntry;
use crate::store::CacheError;

/// Load/save port for cache entries.
#[async_trait]
pub trait CacheSnapshotStore: Send + Sync {
    /// Load all previously persisted entries.
    async fn load(&self) -> Result<Vec<CacheEntry>, CacheError>;

    /// Persist the given entries, replacing any prior snapshot.
    async fn save(&self, entries: Vec<CacheEntry>) -> Result<(), CacheError>;
}

/// In-memory snapshot store, for tests and embedders that opt out of
/// persistence.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    entries: tokio::sync::Mutex<Vec<CacheEntry>>,
}

#[async_trait]
impl CacheSnapshotStore for InMemorySnapshotStore {
    async fn load(&self) -> Result<Vec<CacheEntry>, CacheError> {
        Ok(self.entries.lock().await.clone())
    }

    async fn save(&self, entries: Vec<CacheEntry>) -> Result<(), CacheError> {
        *self.entries.lock().await = entries;
        Ok(())
    }
}
