//! Event union and broadcast bus.
//!
//! [`EventBus`] is the central publish/subscribe hub for [`PipelineEvent`]s,
//! backed by a `tokio::sync::broadcast` channel. It is designed to be shared
//! via `Arc<EventBus>` across the scheduler and orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use storyreel_core::job::{JobType, Stage};

// ---------------------------------------------------------------------------
// Stage progress
// ---------------------------------------------------------------------------

/// Status carried by a per-scene stage progress update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Processing,
    Completed,
    Failed,
}

/// One progress update for a scene within a pipeline run.
///
/// Emitted at every state transition: `Processing` at 0%, `Completed` or
/// `Failed` at 100%.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub run_id: Uuid,
    pub stage: Stage,
    pub scene_id: String,
    /// Percentage complete for this scene's stage, `0..=100`.
    pub progress: u8,
    pub status: StageStatus,
    pub error: Option<String>,
    pub asset_url: Option<String>,
    pub estimated_cost: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressUpdate {
    /// A `Processing` update at 0%.
    pub fn processing(run_id: Uuid, stage: Stage, scene_id: impl Into<String>) -> Self {
        Self {
            run_id,
            stage,
            scene_id: scene_id.into(),
            progress: 0,
            status: StageStatus::Processing,
            error: None,
            asset_url: None,
            estimated_cost: None,
            timestamp: Utc::now(),
        }
    }

    /// A `Completed` update at 100% carrying the produced asset.
    pub fn completed(
        run_id: Uuid,
        stage: Stage,
        scene_id: impl Into<String>,
        asset_url: impl Into<String>,
        cost: f64,
    ) -> Self {
        Self {
            run_id,
            stage,
            scene_id: scene_id.into(),
            progress: 100,
            status: StageStatus::Completed,
            error: None,
            asset_url: Some(asset_url.into()),
            estimated_cost: Some(cost),
            timestamp: Utc::now(),
        }
    }

    /// A `Failed` update at 100% carrying the terminal error.
    pub fn failed(
        run_id: Uuid,
        stage: Stage,
        scene_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            stage,
            scene_id: scene_id.into(),
            progress: 100,
            status: StageStatus::Failed,
            error: Some(error.into()),
            asset_url: None,
            estimated_cost: None,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineEvent
// ---------------------------------------------------------------------------

/// Everything observable about a run: scene stage progress plus scheduler
/// job lifecycle events, as a single union so subscribers need only one
/// receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageProgress(ProgressUpdate),
    JobCompleted {
        job_id: Uuid,
        job_type: JobType,
        cost: f64,
    },
    JobFailed {
        job_id: Uuid,
        job_type: JobType,
        error: String,
    },
    JobRetried {
        job_id: Uuid,
        job_type: JobType,
        retry_count: u32,
        delay_ms: u64,
    },
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`PipelineEvent`]. When the buffer
/// is full, the oldest un-consumed messages are dropped and slow receivers
/// observe a `RecvError::Lagged`.
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: PipelineEvent) {
        // Ignore the SendError; it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
