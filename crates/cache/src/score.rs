//! Eviction scoring.
//!
//! Every entry is scored by a weighted blend of recency, hit count, size,
//! and (for prompt entries) generation value. Lowest-scoring entries are
//! evicted first under size pressure.

use chrono::{DateTime, Utc};

use crate::entry::{CacheEntry, EntryKind};

/// Weight factor for recency. Newer entries score higher.
pub const WEIGHT_RECENCY: f64 = 0.35;
/// Weight factor for hit count. Frequently reused entries score higher.
pub const WEIGHT_HITS: f64 = 0.25;
/// Weight factor for size. Smaller entries score higher.
pub const WEIGHT_SIZE: f64 = 0.20;
/// Weight factor for value (quality and avoided cost, prompt entries only).
pub const WEIGHT_VALUE: f64 = 0.20;

/// Hit count at which the hits component reaches 0.5.
const HITS_HALF_POINT: f64 = 5.0;

/// Age at which the recency component has decayed to 0.5, seconds.
const RECENCY_HALF_LIFE_SECS: f64 = 3600.0;

/// Composite keep-worthiness score in `0.0..=1.0`.
///
/// `max_entry_bytes` is the largest admissible entry (10% of the ceiling);
/// it normalizes the size component so the smallest entries approach 1.0.
pub fn eviction_score(entry: &CacheEntry, now: DateTime<Utc>, max_entry_bytes: u64) -> f64 {
    let age_secs = (now - entry.last_access).num_seconds().max(0) as f64;
    let recency = 1.0 / (1.0 + age_secs / RECENCY_HALF_LIFE_SECS);

    let hits = entry.hits as f64 / (entry.hits as f64 + HITS_HALF_POINT);

    let size_norm = if max_entry_bytes > 0 {
        (entry.size_bytes as f64 / max_entry_bytes as f64).clamp(0.0, 1.0)
    } else {
        1.0
    };
    let size = 1.0 - size_norm;

    let value = match &entry.kind {
        EntryKind::Prompt { cost, quality, .. } => {
            let cost_norm = cost / (cost + 1.0);
            (quality.clamp(0.0, 1.0) + cost_norm.clamp(0.0, 1.0)) / 2.0
        }
        // Media entries have no quality/cost signal; score them neutrally.
        EntryKind::Media => 0.5,
    };

    (WEIGHT_RECENCY * recency + WEIGHT_HITS * hits + WEIGHT_SIZE * size + WEIGHT_VALUE * value)
        .clamp(0.0, 1.0)
}
