//! Retry wrapper around provider calls.
//!
//! Retries transient failures with exponential backoff, treats per-attempt
//! wall-clock timeouts as transient failures (not cancellations), skips
//! retries for permanent request errors, and respects cooperative
//! cancellation between attempts. The retry budget here is independent of
//! the batch scheduler's.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use storyreel_core::backoff::{retry_delay, BackoffConfig};

use crate::provider::{GeneratedAsset, GenerationProvider, ProviderError, ProviderRequest};

/// Retry parameters for one call site.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first, not counting it.
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    /// Hard wall-clock limit per attempt, for providers that poll an
    /// asynchronous job to completion. `None` waits indefinitely.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffConfig::default(),
            attempt_timeout: None,
        }
    }
}

/// Call the provider, retrying transient failures.
///
/// Returns the asset together with the number of retries that were needed.
/// Cancellation is honored between attempts and during backoff sleeps;
/// an in-flight provider call is allowed to drain.
pub async fn call_with_retry(
    provider: &dyn GenerationProvider,
    request: &ProviderRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<(GeneratedAsset, u32), ProviderError> {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(ProviderError::Transient("cancelled before completion".into()));
        }

        let outcome = match policy.attempt_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, provider.generate(request.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Transient(format!(
                        "attempt timed out after {}s",
                        limit.as_secs()
                    ))),
                }
            }
            None => provider.generate(request.clone()).await,
        };

        match outcome {
            Ok(asset) => return Ok((asset, attempt)),
            Err(error) if error.is_permanent() => {
                tracing::warn!(
                    kind = request.kind(),
                    error = %error,
                    "Permanent request error, not retrying",
                );
                return Err(error);
            }
            Err(error) => {
                if attempt >= policy.max_retries {
                    return Err(error);
                }
                attempt += 1;
                let delay = retry_delay(attempt, &policy.backoff);
                tracing::warn!(
                    kind = request.kind(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Provider call failed, retrying",
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(error),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        failures: u32,
        calls: AtomicU32,
        permanent: bool,
        hang: bool,
    }

    impl Scripted {
        fn flaky(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                permanent: false,
                hang: false,
            }
        }
    }

    #[async_trait]
    impl GenerationProvider for Scripted {
        async fn generate(
            &self,
            _request: ProviderRequest,
        ) -> Result<GeneratedAsset, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.permanent {
                return Err(ProviderError::Permanent("bad prompt".into()));
            }
            if call < self.failures {
                return Err(ProviderError::Transient("flaky".into()));
            }
            Ok(GeneratedAsset {
                asset_url: "https://assets/ok".into(),
                cost: 0.04,
            })
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest::Image {
            prompt: "a harbor at dawn".into(),
            model: "sdxl".into(),
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
            },
            attempt_timeout: None,
        }
    }

    #[tokio::test]
    async fn succeeds_first_try_with_zero_retries() {
        let provider = Scripted::flaky(0);
        let (asset, retries) =
            call_with_retry(&provider, &request(), &fast_policy(3), &CancellationToken::new())
                .await
                .unwrap();
        assert_eq!(asset.asset_url, "https://assets/ok");
        assert_eq!(retries, 0);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let provider = Scripted::flaky(2);
        let (_, retries) =
            call_with_retry(&provider, &request(), &fast_policy(3), &CancellationToken::new())
                .await
                .unwrap();
        assert_eq!(retries, 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let provider = Scripted::flaky(10);
        let err =
            call_with_retry(&provider, &request(), &fast_policy(2), &CancellationToken::new())
                .await
                .unwrap_err();
        assert!(!err.is_permanent());
        // Initial attempt plus two retries.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_skips_retries() {
        let provider = Scripted {
            failures: 0,
            calls: AtomicU32::new(0),
            permanent: true,
            hang: false,
        };
        let err =
            call_with_retry(&provider, &request(), &fast_policy(5), &CancellationToken::new())
                .await
                .unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_timeout_is_a_transient_failure() {
        let provider = Scripted {
            failures: 0,
            calls: AtomicU32::new(0),
            permanent: false,
            hang: true,
        };
        let policy = RetryPolicy {
            attempt_timeout: Some(Duration::from_millis(10)),
            ..fast_policy(1)
        };
        let err = call_with_retry(&provider, &request(), &policy, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!err.is_permanent());
        // Timed out twice: the retry was attempted.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_before_first_attempt() {
        let provider = Scripted::flaky(0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(call_with_retry(&provider, &request(), &fast_policy(3), &cancel)
            .await
            .is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }
}
