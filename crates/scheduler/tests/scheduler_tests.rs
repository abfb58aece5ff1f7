//! End-to-end scheduler behavior with scripted processors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use storyreel_core::backoff::BackoffConfig;
use storyreel_core::job::{Job, JobPriority, JobState, JobType};
use storyreel_events::{EventBus, PipelineEvent};
use storyreel_scheduler::{
    BatchScheduler, JobOutput, JobProcessor, ProcessorError, SchedulerConfig,
};

// ---------------------------------------------------------------------------
// Scripted processors
// ---------------------------------------------------------------------------

/// Succeeds every job at a fixed cost, tracking peak concurrency.
struct EchoProcessor {
    cost: f64,
    hold: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl EchoProcessor {
    fn new(cost: f64) -> Self {
        Self::with_hold(cost, Duration::from_millis(20))
    }

    fn with_hold(cost: f64, hold: Duration) -> Self {
        Self {
            cost,
            hold,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl JobProcessor for EchoProcessor {
    async fn process(
        &self,
        batch: &[Job],
    ) -> Result<Vec<Result<JobOutput, ProcessorError>>, ProcessorError> {
        let now = self.in_flight.fetch_add(batch.len(), Ordering::SeqCst) + batch.len();
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.in_flight.fetch_sub(batch.len(), Ordering::SeqCst);

        Ok(batch
            .iter()
            .map(|job| {
                Ok(JobOutput {
                    asset_url: Some(format!("https://assets/{}", job.id)),
                    cost: self.cost,
                })
            })
            .collect())
    }
}

/// Fails each job a scripted number of times before succeeding.
struct FlakyProcessor {
    failures_before_success: u32,
    attempts: Mutex<HashMap<Uuid, u32>>,
}

impl FlakyProcessor {
    fn new(failures_before_success: u32) -> Self {
        Self {
            failures_before_success,
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl JobProcessor for FlakyProcessor {
    async fn process(
        &self,
        batch: &[Job],
    ) -> Result<Vec<Result<JobOutput, ProcessorError>>, ProcessorError> {
        let mut attempts = self.attempts.lock().unwrap();
        Ok(batch
            .iter()
            .map(|job| {
                let count = attempts.entry(job.id).or_insert(0);
                *count += 1;
                if *count <= self.failures_before_success {
                    Err(ProcessorError::Transient("provider hiccup".into()))
                } else {
                    Ok(JobOutput {
                        asset_url: Some("https://assets/ok".into()),
                        cost: 0.04,
                    })
                }
            })
            .collect())
    }
}

/// Always fails, with a configurable classification.
struct DeadProcessor {
    permanent: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl JobProcessor for DeadProcessor {
    async fn process(
        &self,
        batch: &[Job],
    ) -> Result<Vec<Result<JobOutput, ProcessorError>>, ProcessorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(batch
            .iter()
            .map(|_| {
                if self.permanent {
                    Err(ProcessorError::Permanent("content policy".into()))
                } else {
                    Err(ProcessorError::Transient("timeout".into()))
                }
            })
            .collect())
    }
}

/// Throws for the whole batch.
struct ExplodingProcessor;

#[async_trait]
impl JobProcessor for ExplodingProcessor {
    async fn process(
        &self,
        _batch: &[Job],
    ) -> Result<Vec<Result<JobOutput, ProcessorError>>, ProcessorError> {
        Err(ProcessorError::Transient("connection reset".into()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval: Duration::from_millis(10),
        backoff: BackoffConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
        },
        ..Default::default()
    }
}

/// Poll `$cond` (an async-context expression) until it holds or 5s elapse.
macro_rules! wait_until {
    ($cond:expr) => {{
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if $cond {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached within 5s"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }};
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn jobs_complete_and_accumulate_cost() {
    let scheduler = BatchScheduler::new(fast_config(), Arc::new(EventBus::default()));
    scheduler
        .register_processor(JobType::Image, Arc::new(EchoProcessor::new(0.04)))
        .await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            scheduler
                .submit(Job::new(JobType::Image, serde_json::json!({"p": "x"})))
                .await,
        );
    }

    let cancel = CancellationToken::new();
    let handle = scheduler.spawn(cancel.clone());
    wait_until!(scheduler.stats().await.completed == 3);
    cancel.cancel();
    handle.await.unwrap();

    for id in ids {
        assert_eq!(scheduler.status(id).await, JobState::Completed);
    }
    let stats = scheduler.stats().await;
    assert!((stats.total_cost - 0.12).abs() < 1e-9);
    assert_eq!(stats.failed, 0);
    assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);
    assert!(stats.avg_processing_secs > 0.0);
}

#[tokio::test]
async fn dependent_job_waits_for_dependency() {
    let scheduler = BatchScheduler::new(fast_config(), Arc::new(EventBus::default()));
    scheduler
        .register_processor(JobType::Image, Arc::new(EchoProcessor::new(0.04)))
        .await;
    scheduler
        .register_processor(JobType::Video, Arc::new(EchoProcessor::new(0.5)))
        .await;

    let image = Job::new(JobType::Image, serde_json::json!({}));
    let image_id = image.id;
    let video = Job::new(JobType::Video, serde_json::json!({}))
        .with_priority(JobPriority::Urgent)
        .with_dependencies(vec![image_id]);
    let video_id = video.id;

    // Submit the dependent first; it must never run before its dependency.
    scheduler.submit(video).await;
    scheduler.run_tick().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.status(video_id).await, JobState::Queued);

    scheduler.submit(image).await;
    let cancel = CancellationToken::new();
    let handle = scheduler.spawn(cancel.clone());
    wait_until!(scheduler.status(video_id).await == JobState::Completed);
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(scheduler.status(image_id).await, JobState::Completed);
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let events = Arc::new(EventBus::default());
    let mut rx = events.subscribe();
    let scheduler = BatchScheduler::new(fast_config(), events);
    scheduler
        .register_processor(JobType::Image, Arc::new(FlakyProcessor::new(2)))
        .await;

    let id = scheduler
        .submit(Job::new(JobType::Image, serde_json::json!({})).with_max_retries(3))
        .await;

    let cancel = CancellationToken::new();
    let handle = scheduler.spawn(cancel.clone());
    wait_until!(scheduler.status(id).await == JobState::Completed);
    cancel.cancel();
    handle.await.unwrap();

    // Two retry events, then completion.
    let mut retries = 0;
    let mut completed = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            PipelineEvent::JobRetried { retry_count, .. } => {
                retries += 1;
                assert!(retry_count <= 3);
            }
            PipelineEvent::JobCompleted { job_id, .. } => {
                assert_eq!(job_id, id);
                completed = true;
            }
            _ => {}
        }
    }
    assert_eq!(retries, 2);
    assert!(completed);
}

#[tokio::test]
async fn retries_are_bounded_by_max_retries() {
    let scheduler = BatchScheduler::new(fast_config(), Arc::new(EventBus::default()));
    let processor = Arc::new(DeadProcessor {
        permanent: false,
        calls: AtomicUsize::new(0),
    });
    scheduler
        .register_processor(JobType::Audio, Arc::clone(&processor) as _)
        .await;

    let id = scheduler
        .submit(Job::new(JobType::Audio, serde_json::json!({})).with_max_retries(2))
        .await;

    let cancel = CancellationToken::new();
    let handle = scheduler.spawn(cancel.clone());
    wait_until!(scheduler.status(id).await == JobState::Failed);
    cancel.cancel();
    handle.await.unwrap();

    // Initial attempt plus exactly two retries.
    assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn permanent_failures_are_not_retried() {
    let scheduler = BatchScheduler::new(fast_config(), Arc::new(EventBus::default()));
    let processor = Arc::new(DeadProcessor {
        permanent: true,
        calls: AtomicUsize::new(0),
    });
    scheduler
        .register_processor(JobType::Image, Arc::clone(&processor) as _)
        .await;

    let id = scheduler
        .submit(Job::new(JobType::Image, serde_json::json!({})).with_max_retries(5))
        .await;

    let cancel = CancellationToken::new();
    let handle = scheduler.spawn(cancel.clone());
    wait_until!(scheduler.status(id).await == JobState::Failed);
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn whole_batch_error_fails_every_job() {
    let scheduler = BatchScheduler::new(fast_config(), Arc::new(EventBus::default()));
    scheduler
        .register_processor(JobType::Script, Arc::new(ExplodingProcessor))
        .await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            scheduler
                .submit(Job::new(JobType::Script, serde_json::json!({})).with_max_retries(0))
                .await,
        );
    }

    let cancel = CancellationToken::new();
    let handle = scheduler.spawn(cancel.clone());
    wait_until!(scheduler.stats().await.failed == 3);
    cancel.cancel();
    handle.await.unwrap();

    for id in ids {
        assert_eq!(scheduler.status(id).await, JobState::Failed);
    }
    // No job left dangling in processing.
    assert_eq!(scheduler.stats().await.processing, 0);
}

#[tokio::test]
async fn memory_budget_bounds_concurrency() {
    // Image jobs carry a 256 MB base estimate; a 600 MB ceiling admits at
    // most two at a time even though concurrency slots would allow more.
    let config = SchedulerConfig {
        max_memory_mb: 600.0,
        max_concurrent_jobs: 8,
        ..fast_config()
    };
    let scheduler = BatchScheduler::new(config, Arc::new(EventBus::default()));
    let processor = Arc::new(EchoProcessor::new(0.04));
    scheduler
        .register_processor(JobType::Image, Arc::clone(&processor) as _)
        .await;

    for _ in 0..6 {
        scheduler
            .submit(Job::new(JobType::Image, serde_json::json!({})))
            .await;
    }

    let cancel = CancellationToken::new();
    let handle = scheduler.spawn(cancel.clone());
    wait_until!(scheduler.stats().await.completed == 6);
    cancel.cancel();
    handle.await.unwrap();

    assert!(processor.peak_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn budget_counters_return_to_zero_after_failures() {
    let scheduler = BatchScheduler::new(fast_config(), Arc::new(EventBus::default()));
    scheduler
        .register_processor(JobType::Video, Arc::new(ExplodingProcessor))
        .await;

    let id = scheduler
        .submit(Job::new(JobType::Video, serde_json::json!({})).with_max_retries(0))
        .await;

    let cancel = CancellationToken::new();
    let handle = scheduler.spawn(cancel.clone());
    wait_until!(scheduler.status(id).await == JobState::Failed);
    // The batch reservation is released when the dispatch task finishes,
    // momentarily after the terminal state becomes visible.
    wait_until!(scheduler.budget().snapshot().running_jobs == 0);
    cancel.cancel();
    handle.await.unwrap();

    let usage = scheduler.budget().snapshot();
    assert!(usage.memory_mb.abs() < f64::EPSILON);
    assert!(usage.cost_rate.abs() < f64::EPSILON);
}

#[tokio::test]
async fn cancelled_queued_job_never_runs() {
    let scheduler = BatchScheduler::new(fast_config(), Arc::new(EventBus::default()));
    scheduler
        .register_processor(JobType::Image, Arc::new(EchoProcessor::new(0.04)))
        .await;

    let id = scheduler
        .submit(Job::new(JobType::Image, serde_json::json!({})))
        .await;
    assert!(scheduler.cancel(id).await);
    assert_eq!(scheduler.status(id).await, JobState::NotFound);

    scheduler.run_tick().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.stats().await.completed, 0);
}

#[tokio::test]
async fn cancelling_in_flight_job_discards_its_result() {
    let scheduler = BatchScheduler::new(fast_config(), Arc::new(EventBus::default()));
    scheduler
        .register_processor(
            JobType::Image,
            Arc::new(EchoProcessor::with_hold(0.04, Duration::from_millis(300))),
        )
        .await;

    let id = scheduler
        .submit(Job::new(JobType::Image, serde_json::json!({})))
        .await;
    scheduler.run_tick().await;
    wait_until!(scheduler.status(id).await == JobState::Processing);

    // Running jobs are only flagged, not force-killed.
    assert!(!scheduler.cancel(id).await);
    wait_until!(scheduler.status(id).await == JobState::NotFound);
    assert_eq!(scheduler.stats().await.completed, 0);
}

#[tokio::test]
async fn stats_estimate_wait_from_queue_depth() {
    let config = SchedulerConfig {
        max_concurrent_jobs: 2,
        ..fast_config()
    };
    let scheduler = BatchScheduler::new(config, Arc::new(EventBus::default()));
    // No processor registered: jobs stay queued.
    for _ in 0..4 {
        scheduler
            .submit(Job::new(JobType::Image, serde_json::json!({})))
            .await;
    }
    let stats = scheduler.stats().await;
    assert_eq!(stats.queued_total, 4);
    assert_eq!(stats.queued.get(&JobType::Image), Some(&4));
    // No completions yet, so the wait estimate is zero but well-defined.
    assert!(stats.estimated_wait_secs.abs() < f64::EPSILON);
}
