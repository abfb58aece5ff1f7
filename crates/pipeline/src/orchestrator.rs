//! The pipeline orchestrator.
//!
//! Drives a project through the ordered stages (images, then audio, then
//! video), one state machine per stage per scene:
//! `pending -> (cache check) -> completed (hit, cost 0)` or
//! `pending -> processing -> (provider call, retried) -> completed | failed`.
//!
//! Image and audio batches fan out concurrently with an inter-batch pause;
//! the video stage is strictly sequential because each call polls a
//! provider job to completion under a harder rate limit, and consumes the
//! image URL produced for the same scene. Per-scene failures are isolated
//! into the result's error list and never abort sibling scenes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use storyreel_cache::{CacheEntry, CacheStore};
use storyreel_core::fingerprint::prompt_key;
use storyreel_core::job::Stage;
use storyreel_events::{EventBus, PipelineEvent, ProgressUpdate};

use crate::config::{PipelineOptions, ProjectConfig, SceneConfig};
use crate::provider::{GenerationProvider, ProviderRequest};
use crate::result::{CacheOutcome, PipelineResult, StageAsset, StageError};
use crate::retry::{call_with_retry, RetryPolicy};

/// Quality score recorded with cache write-backs. Providers do not report
/// one, so freshly generated assets all start from the same baseline.
const DEFAULT_RESULT_QUALITY: f64 = 0.75;

/// Error recorded for a scene whose video stage cannot run.
const NO_REFERENCE_IMAGE: &str = "image stage failed; no reference image for video";

/// The three per-stage providers a pipeline run calls into.
#[derive(Clone)]
pub struct ProviderSet {
    pub image: Arc<dyn GenerationProvider>,
    pub audio: Arc<dyn GenerationProvider>,
    pub video: Arc<dyn GenerationProvider>,
}

pub struct PipelineOrchestrator {
    cache: Arc<CacheStore>,
    providers: ProviderSet,
    events: Arc<EventBus>,
    options: PipelineOptions,
    cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Per-scene outcome bookkeeping
// ---------------------------------------------------------------------------

struct SceneOutcome {
    scene_id: String,
    outcome: Result<StageAsset, String>,
    /// Whether the cache was consulted for this asset.
    looked_up: bool,
    cache_hit: bool,
    cost_saved: f64,
}

/// Accumulates per-scene outcomes into the final result.
#[derive(Default)]
struct RunAccumulator {
    images: Vec<StageAsset>,
    audio: Vec<StageAsset>,
    videos: Vec<StageAsset>,
    errors: Vec<StageError>,
    cache: CacheOutcome,
    total_cost: f64,
}

impl RunAccumulator {
    fn absorb(&mut self, stage: Stage, outcome: SceneOutcome) {
        if outcome.looked_up {
            if outcome.cache_hit {
                self.cache.hits += 1;
                self.cache.cost_saved += outcome.cost_saved;
            } else {
                self.cache.misses += 1;
            }
        }
        match outcome.outcome {
            Ok(asset) => {
                self.total_cost += asset.cost;
                match stage {
                    Stage::Image => self.images.push(asset),
                    Stage::Audio => self.audio.push(asset),
                    Stage::Video => self.videos.push(asset),
                }
            }
            Err(error) => self.errors.push(StageError {
                scene_id: outcome.scene_id,
                stage,
                error,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

impl PipelineOrchestrator {
    pub fn new(
        cache: Arc<CacheStore>,
        providers: ProviderSet,
        events: Arc<EventBus>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            cache,
            providers,
            events,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that cancels this orchestrator's runs: no further stages or
    /// batches are scheduled, while in-flight provider calls drain.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute the full pipeline for one project and aggregate the result.
    pub async fn run(&self, project: &ProjectConfig) -> PipelineResult {
        let run_id = Uuid::new_v4();
        tracing::info!(
            run_id = %run_id,
            project_id = %project.id,
            scene_count = project.scenes.len(),
            "Pipeline run started",
        );

        let mut acc = RunAccumulator::default();

        // Stage 1: images. The video stage depends on these URLs.
        let image_outcomes = self
            .run_batched_stage(run_id, Stage::Image, &project.scenes)
            .await;
        let mut image_urls: HashMap<String, String> = HashMap::new();
        for outcome in image_outcomes {
            if let Ok(asset) = &outcome.outcome {
                image_urls.insert(asset.scene_id.clone(), asset.asset_url.clone());
            }
            acc.absorb(Stage::Image, outcome);
        }

        // Stage 2: audio. Independent of images; ordered after them for
        // progress-reporting clarity, not correctness.
        for outcome in self
            .run_batched_stage(run_id, Stage::Audio, &project.scenes)
            .await
        {
            acc.absorb(Stage::Audio, outcome);
        }

        // Stage 3: video, strictly sequential.
        self.run_video_stage(run_id, &project.scenes, &image_urls, &mut acc)
            .await;

        let success = acc.errors.is_empty();
        tracing::info!(
            run_id = %run_id,
            success,
            total_cost = acc.total_cost,
            cache_hits = acc.cache.hits,
            cache_misses = acc.cache.misses,
            errors = acc.errors.len(),
            "Pipeline run finished",
        );

        PipelineResult {
            run_id,
            success,
            total_cost: acc.total_cost,
            images: acc.images,
            audio: acc.audio,
            videos: acc.videos,
            errors: acc.errors,
            cache: acc.cache,
        }
    }

    // -- stages --------------------------------------------------------------

    async fn run_batched_stage(
        &self,
        run_id: Uuid,
        stage: Stage,
        scenes: &[SceneConfig],
    ) -> Vec<SceneOutcome> {
        let batch_size = self.options.batch_size.max(1);
        let mut outcomes = Vec::with_capacity(scenes.len());

        for (index, chunk) in scenes.chunks(batch_size).enumerate() {
            if self.cancel.is_cancelled() {
                tracing::info!(
                    run_id = %run_id,
                    stage = stage.as_str(),
                    "Run cancelled; skipping remaining batches",
                );
                break;
            }
            if index > 0 {
                tokio::time::sleep(self.options.batch_delay).await;
            }
            let batch = futures::future::join_all(
                chunk
                    .iter()
                    .map(|scene| self.generate_scene_asset(run_id, stage, scene, None)),
            )
            .await;
            outcomes.extend(batch);
        }
        outcomes
    }

    async fn run_video_stage(
        &self,
        run_id: Uuid,
        scenes: &[SceneConfig],
        image_urls: &HashMap<String, String>,
        acc: &mut RunAccumulator,
    ) {
        let mut dispatched = false;
        for scene in scenes {
            if self.cancel.is_cancelled() {
                tracing::info!(run_id = %run_id, "Run cancelled; skipping remaining video calls");
                break;
            }
            let Some(image_url) = image_urls.get(&scene.id) else {
                // No usable reference frame: the video stage for this scene
                // is never attempted and the skip is an error of its own.
                self.events
                    .publish(PipelineEvent::StageProgress(ProgressUpdate::failed(
                        run_id,
                        Stage::Video,
                        &scene.id,
                        NO_REFERENCE_IMAGE,
                    )));
                acc.errors.push(StageError {
                    scene_id: scene.id.clone(),
                    stage: Stage::Video,
                    error: NO_REFERENCE_IMAGE.to_string(),
                });
                continue;
            };
            if dispatched {
                tokio::time::sleep(self.options.video_call_delay).await;
            }
            dispatched = true;
            let outcome = self
                .generate_scene_asset(run_id, Stage::Video, scene, Some(image_url))
                .await;
            acc.absorb(Stage::Video, outcome);
        }
    }

    // -- one asset -----------------------------------------------------------

    async fn generate_scene_asset(
        &self,
        run_id: Uuid,
        stage: Stage,
        scene: &SceneConfig,
        image_url: Option<&str>,
    ) -> SceneOutcome {
        self.events
            .publish(PipelineEvent::StageProgress(ProgressUpdate::processing(
                run_id, stage, &scene.id,
            )));

        // The cache prompt doubles as the provider request content; audio
        // and video assets are deterministic per request, so only image
        // lookups may match fuzzily.
        let (request, cache_prompt, cache_model, allow_fuzzy) = match stage {
            Stage::Image => (
                ProviderRequest::Image {
                    prompt: scene.image_prompt.clone(),
                    model: self.options.image_model.clone(),
                },
                scene.image_prompt.clone(),
                self.options.image_model.clone(),
                true,
            ),
            Stage::Audio => (
                ProviderRequest::Audio {
                    text: scene.narration_text.clone(),
                    voice: scene.voice.clone(),
                },
                scene.narration_text.clone(),
                scene.voice.clone(),
                false,
            ),
            Stage::Video => {
                let reference = image_url.unwrap_or_default();
                (
                    ProviderRequest::Video {
                        image_url: reference.to_string(),
                        motion_prompt: scene.motion_prompt.clone(),
                        duration_secs: scene.clip_duration_secs,
                        model: self.options.video_model.clone(),
                    },
                    format!("{reference} {}", scene.motion_prompt),
                    self.options.video_model.clone(),
                    false,
                )
            }
        };

        if self.options.enable_caching {
            let key = prompt_key(&cache_prompt, &cache_model);
            if let Some(entry) = self.cache.get_exact(&key).await {
                return self.cached_outcome(run_id, stage, scene, entry);
            }
            if allow_fuzzy {
                if let Some((entry, similarity)) = self
                    .cache
                    .get_fuzzy(&cache_prompt, &cache_model, self.options.fuzzy_threshold)
                    .await
                {
                    tracing::debug!(
                        run_id = %run_id,
                        scene_id = %scene.id,
                        similarity,
                        "Fuzzy cache hit for image prompt",
                    );
                    return self.cached_outcome(run_id, stage, scene, entry);
                }
            }
        }

        let policy = RetryPolicy {
            max_retries: self.options.max_retries,
            backoff: self.options.backoff.clone(),
            attempt_timeout: (stage == Stage::Video).then_some(self.options.video_attempt_timeout),
        };
        let provider: &dyn GenerationProvider = match stage {
            Stage::Image => self.providers.image.as_ref(),
            Stage::Audio => self.providers.audio.as_ref(),
            Stage::Video => self.providers.video.as_ref(),
        };

        match call_with_retry(provider, &request, &policy, &self.cancel).await {
            Ok((asset, retries)) => {
                if self.options.enable_caching {
                    let written = self
                        .cache
                        .put_prompt(
                            &cache_prompt,
                            &cache_model,
                            serde_json::json!({ "asset_url": asset.asset_url }),
                            asset.cost,
                            DEFAULT_RESULT_QUALITY,
                            vec![scene.id.clone(), stage.as_str().to_string()],
                            self.options.cache_ttl,
                        )
                        .await;
                    if written.is_none() {
                        // Oversized result: still returned to the caller,
                        // just not cached.
                        tracing::warn!(
                            scene_id = %scene.id,
                            stage = stage.as_str(),
                            "Generation result too large to cache",
                        );
                    }
                }
                self.events
                    .publish(PipelineEvent::StageProgress(ProgressUpdate::completed(
                        run_id,
                        stage,
                        &scene.id,
                        &asset.asset_url,
                        asset.cost,
                    )));
                SceneOutcome {
                    scene_id: scene.id.clone(),
                    outcome: Ok(StageAsset {
                        scene_id: scene.id.clone(),
                        asset_url: asset.asset_url,
                        cost: asset.cost,
                        cached: false,
                        retries,
                    }),
                    looked_up: self.options.enable_caching,
                    cache_hit: false,
                    cost_saved: 0.0,
                }
            }
            Err(error) => {
                tracing::error!(
                    run_id = %run_id,
                    scene_id = %scene.id,
                    stage = stage.as_str(),
                    error = %error,
                    "Stage failed for scene",
                );
                self.events
                    .publish(PipelineEvent::StageProgress(ProgressUpdate::failed(
                        run_id,
                        stage,
                        &scene.id,
                        error.to_string(),
                    )));
                SceneOutcome {
                    scene_id: scene.id.clone(),
                    outcome: Err(error.to_string()),
                    looked_up: self.options.enable_caching,
                    cache_hit: false,
                    cost_saved: 0.0,
                }
            }
        }
    }

    fn cached_outcome(
        &self,
        run_id: Uuid,
        stage: Stage,
        scene: &SceneConfig,
        entry: CacheEntry,
    ) -> SceneOutcome {
        let asset_url = entry
            .data
            .get("asset_url")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        tracing::debug!(
            run_id = %run_id,
            scene_id = %scene.id,
            stage = stage.as_str(),
            "Cache hit; provider call avoided",
        );
        self.events
            .publish(PipelineEvent::StageProgress(ProgressUpdate::completed(
                run_id, stage, &scene.id, &asset_url, 0.0,
            )));
        SceneOutcome {
            scene_id: scene.id.clone(),
            outcome: Ok(StageAsset {
                scene_id: scene.id.clone(),
                asset_url,
                cost: 0.0,
                cached: true,
                retries: 0,
            }),
            looked_up: true,
            cache_hit: true,
            cost_saved: entry.unit_cost(),
        }
    }
}
