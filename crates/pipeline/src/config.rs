//! Caller-supplied project configuration and orchestration options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use storyreel_core::backoff::BackoffConfig;
use storyreel_core::error::CoreError;

/// One scene of the video: prompts and settings per asset type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    pub id: String,
    /// Prompt for the still image.
    pub image_prompt: String,
    /// Narration text spoken over the scene.
    pub narration_text: String,
    /// Voice identifier for narration synthesis.
    pub voice: String,
    /// Motion prompt animating the scene's image into a clip.
    pub motion_prompt: String,
    /// Target clip length, seconds.
    pub clip_duration_secs: f64,
}

/// A project: a title plus an ordered list of scenes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: String,
    pub title: String,
    pub scenes: Vec<SceneConfig>,
}

/// Orchestration tuning.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PipelineOptions {
    /// Consult and populate the cache around every provider call.
    pub enable_caching: bool,
    /// Scenes processed concurrently per image/audio batch.
    pub batch_size: usize,
    /// Retry attempts per provider call, independent of the scheduler's.
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    /// Pause between image/audio batches, respecting provider rate limits.
    pub batch_delay: Duration,
    /// Pause between sequential video calls. Video providers rate-limit
    /// harder and each call polls a job to completion.
    pub video_call_delay: Duration,
    /// Wall-clock limit per video attempt.
    pub video_attempt_timeout: Duration,
    /// Similarity floor for fuzzy image-cache lookups. Audio lookups are
    /// always exact: narration synthesis is deterministic per (text, voice).
    pub fuzzy_threshold: f64,
    /// Model identifier sent with image requests.
    pub image_model: String,
    /// Model identifier sent with video requests.
    pub video_model: String,
    /// Time-to-live for cache write-backs. `None` caches indefinitely.
    pub cache_ttl: Option<Duration>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            enable_caching: true,
            batch_size: 3,
            max_retries: 3,
            backoff: BackoffConfig::default(),
            batch_delay: Duration::from_millis(500),
            video_call_delay: Duration::from_secs(2),
            video_attempt_timeout: Duration::from_secs(300),
            fuzzy_threshold: 0.85,
            image_model: "sdxl".into(),
            video_model: "svd".into(),
            cache_ttl: None,
        }
    }
}

impl PipelineOptions {
    /// Validate option ranges.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.batch_size == 0 {
            return Err(CoreError::Validation(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.fuzzy_threshold) {
            return Err(CoreError::Validation(format!(
                "fuzzy_threshold must be within 0.0..=1.0, got {}",
                self.fuzzy_threshold
            )));
        }
        Ok(())
    }
}
