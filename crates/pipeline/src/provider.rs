//! Generation-provider boundary.
//!
//! Providers are black boxes with unspecified latency: one async call per
//! asset type returning an asset URL, or an error classified as transient
//! (retryable) or permanent (invalid input, content policy; never
//! retried). The wire format behind an implementation is its own business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Payload for one provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderRequest {
    Image {
        prompt: String,
        model: String,
    },
    Audio {
        text: String,
        voice: String,
    },
    Video {
        /// Reference frame produced by the image stage for the same scene.
        image_url: String,
        motion_prompt: String,
        duration_secs: f64,
        model: String,
    },
}

impl ProviderRequest {
    /// Short label for logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderRequest::Image { .. } => "image",
            ProviderRequest::Audio { .. } => "audio",
            ProviderRequest::Video { .. } => "video",
        }
    }
}

/// A successfully generated asset reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedAsset {
    pub asset_url: String,
    /// Estimated provider cost of this call, currency units.
    pub cost: f64,
}

/// Provider-side failures, classified for retry purposes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Network/timeout/5xx-equivalent. Retried with backoff.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// Invalid input or content policy. Never retried.
    #[error("Permanent request error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProviderError::Permanent(_))
    }
}

/// One async generation call.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, request: ProviderRequest) -> Result<GeneratedAsset, ProviderError>;
}
