//! Semantic response cache for generation results.
//!
//! Avoids redundant provider calls for semantically equivalent requests:
//! exact lookups by content fingerprint, fuzzy lookups by token-set
//! similarity, size-bounded storage with multi-factor eviction, and a
//! background expiry sweep.

pub mod entry;
pub mod persistence;
pub mod score;
pub mod store;

pub use entry::{CacheEntry, EntryKind};
pub use persistence::CacheSnapshotStore;
pub use store::{CacheConfig, CacheError, CacheStats, CacheStore};
