//! Size-bounded semantic cache store.
//!
//! [`CacheStore`] maps request fingerprints to generated-asset references.
//! Lookups come in two flavors: exact (hash) and fuzzy (token-set
//! similarity over stored prompts, same model only). Under size pressure,
//! entries are evicted lowest-score-first until utilization falls back to
//! the configured target, so the very next insert does not evict again.
//!
//! Shared via `Arc<CacheStore>`; call [`CacheStore::spawn_sweeper`] once to
//! start the background expiry sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use storyreel_core::fingerprint::{normalize_prompt, prompt_key, prompt_similarity};

use crate::entry::{CacheEntry, EntryKind};
use crate::persistence::CacheSnapshotStore;
use crate::score::eviction_score;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Tunable cache parameters.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CacheConfig {
    /// Aggregate size ceiling, bytes.
    pub max_size_bytes: u64,
    /// Utilization eviction restores in one pass, as a fraction of the
    /// ceiling.
    pub eviction_target: f64,
    /// Largest admissible single entry, as a fraction of the ceiling.
    /// Oversized entries are rejected at `put`, not cached at all.
    pub max_entry_fraction: f64,
    /// How often the background sweep removes expired entries.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 64 * 1024 * 1024,
            eviction_target: 0.8,
            max_entry_fraction: 0.1,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Largest admissible single entry, bytes.
    pub fn max_entry_bytes(&self) -> u64 {
        (self.max_size_bytes as f64 * self.max_entry_fraction) as u64
    }

    /// Post-eviction size target, bytes.
    pub fn target_bytes(&self) -> u64 {
        (self.max_size_bytes as f64 * self.eviction_target) as u64
    }
}

/// Errors from the snapshot-persistence port.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Snapshot persistence failed: {0}")]
    Snapshot(String),
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Point-in-time cache statistics, derived from live contents rather than
/// stored incrementally so they are always consistent with what is cached.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_size_bytes: u64,
    /// `total_size_bytes / max_size_bytes`, in `0.0..=1.0`.
    pub utilization: f64,
    pub lookups: u64,
    pub misses: u64,
    /// Share of lookups served from cache, `0.0..=1.0`.
    pub hit_rate: f64,
    /// `Σ entry.cost × entry.hits` over prompt entries.
    pub cost_saved: f64,
    /// Most frequent tags, descending, at most ten.
    pub top_tags: Vec<(String, usize)>,
}

// ---------------------------------------------------------------------------
// CacheStore
// ---------------------------------------------------------------------------

/// Number of top tags reported in [`CacheStats`].
const TOP_TAG_COUNT: usize = 10;

pub struct CacheStore {
    config: CacheConfig,
    entries: RwLock<HashMap<String, CacheEntry>>,
    lookups: AtomicU64,
    misses: AtomicU64,
    snapshot: Option<Arc<dyn CacheSnapshotStore>>,
}

impl CacheStore {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            lookups: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            snapshot: None,
        }
    }

    /// Attach a snapshot-persistence port. The store never persists on its
    /// own; call [`restore`](Self::restore) / [`persist`](Self::persist).
    pub fn with_snapshot_store(mut self, snapshot: Arc<dyn CacheSnapshotStore>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // -- writes -------------------------------------------------------------

    /// Insert an entry under `key`.
    ///
    /// Returns `false` (logged, no-op) when the serialized entry exceeds the
    /// per-entry size limit. Existing entries under the same key are
    /// replaced (last writer wins; entries derive from idempotent results).
    pub async fn put(
        &self,
        key: impl Into<String>,
        data: serde_json::Value,
        kind: EntryKind,
        tags: Vec<String>,
        ttl: Option<Duration>,
    ) -> bool {
        let key = key.into();
        let size_bytes = data.to_string().len() as u64;
        let max_entry = self.config.max_entry_bytes();
        if size_bytes > max_entry {
            tracing::warn!(
                key = %key,
                size_bytes,
                max_entry_bytes = max_entry,
                "Rejecting oversized cache entry",
            );
            return false;
        }

        let now = Utc::now();
        let entry = CacheEntry {
            key: key.clone(),
            data,
            kind,
            created_at: now,
            last_access: now,
            hits: 0,
            size_bytes,
            tags,
            // TTLs beyond chrono's range are treated as effectively forever.
            expires_at: ttl.map(|t| {
                now + chrono::Duration::from_std(t)
                    .unwrap_or_else(|_| chrono::Duration::days(365 * 100))
            }),
        };

        let mut entries = self.entries.write().await;
        entries.insert(key, entry);

        let total: u64 = entries.values().map(|e| e.size_bytes).sum();
        if total > self.config.max_size_bytes {
            self.evict_locked(&mut entries, total);
        }
        true
    }

    /// Insert a prompt-derived entry, returning the computed key.
    #[allow(clippy::too_many_arguments)]
    pub async fn put_prompt(
        &self,
        prompt: &str,
        model: &str,
        data: serde_json::Value,
        cost: f64,
        quality: f64,
        tags: Vec<String>,
        ttl: Option<Duration>,
    ) -> Option<String> {
        let key = prompt_key(prompt, model);
        let kind = EntryKind::Prompt {
            prompt: normalize_prompt(prompt),
            model: model.to_string(),
            cost,
            quality,
        };
        self.put(key.clone(), data, kind, tags, ttl)
            .await
            .then_some(key)
    }

    // -- lookups ------------------------------------------------------------

    /// Direct fingerprint lookup. Expired entries are treated as absent and
    /// dropped on the spot.
    pub async fn get_exact(&self, key: &str) -> Option<CacheEntry> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();

        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.record_hit(now);
                Some(entry.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Similarity lookup over stored prompts for the same model.
    ///
    /// Scores every unexpired prompt entry by token-set similarity against
    /// `prompt` and returns the best candidate at or above `threshold`,
    /// together with its similarity. Ties break by similarity, then by most
    /// recent creation. Identical normalized prompts score exactly `1.0`.
    pub async fn get_fuzzy(
        &self,
        prompt: &str,
        model: &str,
        threshold: f64,
    ) -> Option<(CacheEntry, f64)> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let query = normalize_prompt(prompt);
        let now = Utc::now();

        let mut entries = self.entries.write().await;
        let mut best: Option<(String, f64)> = None;

        for entry in entries.values() {
            if entry.is_expired(now) {
                continue;
            }
            let EntryKind::Prompt {
                prompt: stored,
                model: stored_model,
                ..
            } = &entry.kind
            else {
                continue;
            };
            if stored_model != model {
                continue;
            }
            let similarity = prompt_similarity(&query, stored);
            if similarity < threshold {
                continue;
            }
            let better = match &best {
                None => true,
                Some((best_key, best_sim)) => {
                    similarity > *best_sim
                        || (similarity == *best_sim
                            && entry.created_at
                                > entries.get(best_key).map(|e| e.created_at).unwrap_or(now))
                }
            };
            if better {
                best = Some((entry.key.clone(), similarity));
            }
        }

        match best {
            Some((key, similarity)) => {
                let entry = entries.get_mut(&key)?;
                entry.record_hit(now);
                tracing::debug!(key = %key, similarity, "Fuzzy cache hit");
                Some((entry.clone(), similarity))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    // -- maintenance --------------------------------------------------------

    /// Remove all expired entries. Returns the number removed.
    pub async fn remove_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, "Expiry sweep removed entries");
        }
        removed
    }

    /// Evict lowest-scoring entries until total size is at or below the
    /// eviction target. Returns the number evicted.
    pub async fn evict_to_target(&self) -> usize {
        let mut entries = self.entries.write().await;
        let total: u64 = entries.values().map(|e| e.size_bytes).sum();
        if total <= self.config.max_size_bytes {
            return 0;
        }
        self.evict_locked(&mut entries, total)
    }

    fn evict_locked(&self, entries: &mut HashMap<String, CacheEntry>, mut total: u64) -> usize {
        let now = Utc::now();
        let max_entry = self.config.max_entry_bytes();
        let target = self.config.target_bytes();

        let mut scored: Vec<(String, u64, f64)> = entries
            .values()
            .map(|e| (e.key.clone(), e.size_bytes, eviction_score(e, now, max_entry)))
            .collect();
        scored.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut evicted = 0;
        for (key, size, score) in scored {
            if total <= target {
                break;
            }
            entries.remove(&key);
            total -= size;
            evicted += 1;
            tracing::debug!(key = %key, score, size_bytes = size, "Evicted cache entry");
        }
        tracing::info!(
            evicted,
            total_size_bytes = total,
            target_bytes = target,
            "Cache eviction pass complete",
        );
        evicted
    }

    /// Spawn the background expiry sweep. Runs until `cancel` triggers.
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Cache sweeper stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        store.remove_expired().await;
                    }
                }
            }
        })
    }

    // -- persistence --------------------------------------------------------

    /// Load entries from the attached snapshot store, skipping any that have
    /// expired since the snapshot was taken. No-op without a port.
    pub async fn restore(&self) -> Result<usize, CacheError> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(0);
        };
        let now = Utc::now();
        let loaded = snapshot.load().await?;
        let mut entries = self.entries.write().await;
        let mut restored = 0;
        for entry in loaded {
            if !entry.is_expired(now) {
                entries.insert(entry.key.clone(), entry);
                restored += 1;
            }
        }
        tracing::info!(restored, "Cache restored from snapshot");
        Ok(restored)
    }

    /// Save current entries through the attached snapshot store. No-op
    /// without a port.
    pub async fn persist(&self) -> Result<(), CacheError> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };
        let entries: Vec<CacheEntry> = self.entries.read().await.values().cloned().collect();
        snapshot.save(entries).await
    }

    // -- stats --------------------------------------------------------------

    /// Derive statistics from current contents.
    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let total_size_bytes: u64 = entries.values().map(|e| e.size_bytes).sum();
        let cost_saved: f64 = entries.values().map(|e| e.unit_cost() * e.hits as f64).sum();

        let mut tag_counts: HashMap<&str, usize> = HashMap::new();
        for entry in entries.values() {
            for tag in &entry.tags {
                *tag_counts.entry(tag.as_str()).or_default() += 1;
            }
        }
        let mut top_tags: Vec<(String, usize)> = tag_counts
            .into_iter()
            .map(|(tag, count)| (tag.to_string(), count))
            .collect();
        top_tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_tags.truncate(TOP_TAG_COUNT);

        let lookups = self.lookups.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let hit_rate = if lookups > 0 {
            (lookups - misses) as f64 / lookups as f64
        } else {
            0.0
        };

        CacheStats {
            entry_count: entries.len(),
            total_size_bytes,
            utilization: total_size_bytes as f64 / self.config.max_size_bytes as f64,
            lookups,
            misses,
            hit_rate,
            cost_saved,
            top_tags,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
