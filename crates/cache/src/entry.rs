//! Cache entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a cache entry was derived from.
///
/// Prompt entries carry the source prompt so fuzzy lookup can re-score it,
/// plus the avoided cost and a quality estimate used by eviction scoring.
/// Media entries are keyed purely by content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryKind {
    Prompt {
        /// Normalized prompt text the entry was generated from.
        prompt: String,
        /// Model identifier the prompt was sent to.
        model: String,
        /// Provider cost avoided each time this entry is reused.
        cost: f64,
        /// Quality estimate in `0.0..=1.0`.
        quality: f64,
    },
    Media,
}

/// A single cached generation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Stable fingerprint the entry is stored under.
    pub key: String,
    /// The cached asset reference (URL plus provider metadata).
    pub data: serde_json::Value,
    pub kind: EntryKind,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub hits: u64,
    pub size_bytes: u64,
    pub tags: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Record a lookup hit.
    pub fn record_hit(&mut self, now: DateTime<Utc>) {
        self.hits += 1;
        self.last_access = now;
    }

    /// The avoided provider cost for prompt entries, zero for media.
    pub fn unit_cost(&self) -> f64 {
        match &self.kind {
            EntryKind::Prompt { cost, .. } => *cost,
            EntryKind::Media => 0.0,
        }
    }
}
