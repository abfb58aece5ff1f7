//! Scheduler adapter for generation providers.
//!
//! [`ProviderJobProcessor`] lets high-fan-out callers push generation work
//! through the batch scheduler instead of the orchestrator's direct stage
//! loop: job payloads deserialize into [`ProviderRequest`]s, the batch fans
//! out concurrently, and results come back one per job in submission order.

use std::sync::Arc;

use async_trait::async_trait;

use storyreel_core::job::Job;
use storyreel_scheduler::{JobOutput, JobProcessor, ProcessorError};

use crate::provider::{GenerationProvider, ProviderError, ProviderRequest};

pub struct ProviderJobProcessor {
    provider: Arc<dyn GenerationProvider>,
}

impl ProviderJobProcessor {
    pub fn new(provider: Arc<dyn GenerationProvider>) -> Self {
        Self { provider }
    }

    async fn run_one(&self, job: &Job) -> Result<JobOutput, ProcessorError> {
        let request: ProviderRequest = serde_json::from_value(job.data.clone())
            // A payload that does not parse can never succeed.
            .map_err(|e| ProcessorError::Permanent(format!("malformed job payload: {e}")))?;

        match self.provider.generate(request).await {
            Ok(asset) => Ok(JobOutput {
                asset_url: Some(asset.asset_url),
                cost: asset.cost,
            }),
            Err(ProviderError::Permanent(message)) => Err(ProcessorError::Permanent(message)),
            Err(ProviderError::Transient(message)) => Err(ProcessorError::Transient(message)),
        }
    }
}

#[async_trait]
impl JobProcessor for ProviderJobProcessor {
    async fn process(
        &self,
        batch: &[Job],
    ) -> Result<Vec<Result<JobOutput, ProcessorError>>, ProcessorError> {
        let results =
            futures::future::join_all(batch.iter().map(|job| self.run_one(job))).await;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use crate::provider::GeneratedAsset;
    use storyreel_core::job::JobType;

    struct StaticProvider;

    #[async_trait]
    impl GenerationProvider for StaticProvider {
        async fn generate(
            &self,
            request: ProviderRequest,
        ) -> Result<GeneratedAsset, ProviderError> {
            match request {
                ProviderRequest::Image { prompt, .. } => Ok(GeneratedAsset {
                    asset_url: format!("https://assets/{prompt}"),
                    cost: 0.04,
                }),
                _ => Err(ProviderError::Permanent("unsupported".into())),
            }
        }
    }

    fn image_job(prompt: &str) -> Job {
        Job::new(
            JobType::Image,
            serde_json::json!({"type": "image", "prompt": prompt, "model": "sdxl"}),
        )
    }

    #[tokio::test]
    async fn results_come_back_in_job_order() {
        let processor = ProviderJobProcessor::new(Arc::new(StaticProvider));
        let batch = vec![image_job("first"), image_job("second")];

        let results = processor.process(&batch).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(
            results[0].as_ref().unwrap().asset_url.as_deref(),
            Some("https://assets/first")
        );
        assert_eq!(
            results[1].as_ref().unwrap().asset_url.as_deref(),
            Some("https://assets/second")
        );
    }

    #[tokio::test]
    async fn malformed_payload_is_a_permanent_failure() {
        let processor = ProviderJobProcessor::new(Arc::new(StaticProvider));
        let batch = vec![Job::new(JobType::Image, serde_json::json!({"nope": true}))];

        let results = processor.process(&batch).await.unwrap();
        assert_matches!(results[0], Err(ProcessorError::Permanent(_)));
    }

    #[tokio::test]
    async fn provider_classification_is_preserved() {
        let processor = ProviderJobProcessor::new(Arc::new(StaticProvider));
        let batch = vec![Job::new(
            JobType::Audio,
            serde_json::json!({"type": "audio", "text": "hi", "voice": "v1"}),
        )];

        let results = processor.process(&batch).await.unwrap();
        assert_matches!(results[0], Err(ProcessorError::Permanent(_)));
    }
}
