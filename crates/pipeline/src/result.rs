//! Aggregate pipeline results.

use serde::Serialize;
use uuid::Uuid;

use storyreel_core::job::Stage;

/// One produced asset.
#[derive(Debug, Clone, Serialize)]
pub struct StageAsset {
    pub scene_id: String,
    pub asset_url: String,
    /// Provider cost actually incurred; zero when served from cache.
    pub cost: f64,
    pub cached: bool,
    /// Retries the provider call needed; zero when cached.
    pub retries: u32,
}

/// One isolated per-scene, per-stage failure.
#[derive(Debug, Clone, Serialize)]
pub struct StageError {
    pub scene_id: String,
    pub stage: Stage,
    pub error: String,
}

/// Cache accounting for one run.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheOutcome {
    pub hits: u64,
    pub misses: u64,
    /// Provider cost avoided through cache hits.
    pub cost_saved: f64,
}

/// Immutable aggregate of one orchestrator run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    /// `true` iff zero errors were recorded. Callers should inspect
    /// `errors` for partial-success handling rather than treating the run
    /// as atomic.
    pub success: bool,
    pub total_cost: f64,
    pub images: Vec<StageAsset>,
    pub audio: Vec<StageAsset>,
    pub videos: Vec<StageAsset>,
    pub errors: Vec<StageError>,
    pub cache: CacheOutcome,
}

impl PipelineResult {
    /// Assets for one stage.
    pub fn assets(&self, stage: Stage) -> &[StageAsset] {
        match stage {
            Stage::Image => &self.images,
            Stage::Audio => &self.audio,
            Stage::Video => &self.videos,
        }
    }

    /// Errors recorded for one scene, any stage.
    pub fn errors_for_scene(&self, scene_id: &str) -> Vec<&StageError> {
        self.errors.iter().filter(|e| e.scene_id == scene_id).collect()
    }
}
