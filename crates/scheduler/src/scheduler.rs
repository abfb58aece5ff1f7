//! Tick-driven batch scheduler.
//!
//! [`BatchScheduler`] converts queued jobs into processor invocations while
//! respecting global admission limits. Each tick it selects an admissible
//! batch per registered job type with a two-pass greedy algorithm, moves the
//! batch into processing, and dispatches it on its own task so slow
//! providers never block the tick loop. Budget reservations are RAII guards
//! held for the lifetime of the dispatch, so failures cannot leak budget.
//!
//! The scheduler is a cheap-to-clone handle over shared state; clone it
//! into any task that needs to submit or inspect jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use storyreel_core::backoff::retry_delay;
use storyreel_core::estimate::{estimated_memory_mb, incremental_mean};
use storyreel_core::job::{apply_transition, Job, JobState, JobTransition, JobType};
use storyreel_events::{EventBus, PipelineEvent};

use crate::config::SchedulerConfig;
use crate::queue::JobQueue;
use crate::resources::{Reservation, ResourceBudget, ResourceLimits, ResourceUsage};

// ---------------------------------------------------------------------------
// Processor contract
// ---------------------------------------------------------------------------

/// Successful output for one job.
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub asset_url: Option<String>,
    pub cost: f64,
}

/// Processor-side failures.
///
/// `Permanent` marks requests that will never succeed (invalid input,
/// content policy); the scheduler skips retries for them to avoid wasting
/// budget. Everything else is treated as transient and retried.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessorError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),
}

/// A registered per-type batch executor.
///
/// `process` receives the whole batch and must return one result per job in
/// the same order. Returning `Err` fails every job in the batch.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(
        &self,
        batch: &[Job],
    ) -> Result<Vec<Result<JobOutput, ProcessorError>>, ProcessorError>;
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Point-in-time scheduler metrics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStats {
    pub queued: HashMap<JobType, usize>,
    pub queued_total: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// `completed / (completed + failed)`, `1.0` before any terminal job.
    pub success_rate: f64,
    pub total_cost: f64,
    pub avg_processing_secs: f64,
    /// `avg_processing_secs × queued_total / max_concurrent_jobs`.
    pub estimated_wait_secs: f64,
    pub usage: ResourceUsage,
}

#[derive(Default)]
struct Timing {
    completed: u64,
    failed: u64,
    total_cost: f64,
    avg_processing_secs: f64,
}

// ---------------------------------------------------------------------------
// BatchScheduler
// ---------------------------------------------------------------------------

struct Inner {
    config: SchedulerConfig,
    queue: AsyncMutex<JobQueue>,
    processors: RwLock<HashMap<JobType, Arc<dyn JobProcessor>>>,
    budget: ResourceBudget,
    events: Arc<EventBus>,
    timing: Mutex<Timing>,
}

#[derive(Clone)]
pub struct BatchScheduler {
    inner: Arc<Inner>,
}

impl BatchScheduler {
    pub fn new(config: SchedulerConfig, events: Arc<EventBus>) -> Self {
        let budget = ResourceBudget::new(ResourceLimits {
            max_concurrent_jobs: config.max_concurrent_jobs,
            max_memory_mb: config.max_memory_mb,
            max_cost_per_hour: config.max_cost_per_hour,
        });
        Self {
            inner: Arc::new(Inner {
                config,
                queue: AsyncMutex::new(JobQueue::new()),
                processors: RwLock::new(HashMap::new()),
                budget,
                events,
                timing: Mutex::new(Timing::default()),
            }),
        }
    }

    /// Register the processor that executes batches of `job_type`. Types
    /// without a processor are skipped by the tick loop.
    pub async fn register_processor(&self, job_type: JobType, processor: Arc<dyn JobProcessor>) {
        self.inner
            .processors
            .write()
            .await
            .insert(job_type, processor);
    }

    /// The shared admission budget (also consulted by tests asserting the
    /// memory bound).
    pub fn budget(&self) -> &ResourceBudget {
        &self.inner.budget
    }

    // -- submission / inspection --------------------------------------------

    /// Enqueue a job. Returns its id.
    pub async fn submit(&self, job: Job) -> Uuid {
        let id = job.id;
        tracing::debug!(
            job_id = %id,
            job_type = job.job_type.as_str(),
            priority = ?job.priority,
            "Job submitted",
        );
        self.inner.queue.lock().await.enqueue(job);
        id
    }

    /// Cancel a job; see [`JobQueue::cancel`] for semantics.
    pub async fn cancel(&self, job_id: Uuid) -> bool {
        self.inner.queue.lock().await.cancel(job_id)
    }

    pub async fn status(&self, job_id: Uuid) -> JobState {
        self.inner.queue.lock().await.status(job_id)
    }

    pub async fn stats(&self) -> SchedulerStats {
        let queue = self.inner.queue.lock().await;
        let queued: HashMap<JobType, usize> = JobType::ALL
            .iter()
            .map(|&t| (t, queue.depth(t)))
            .filter(|(_, depth)| *depth > 0)
            .collect();
        let queued_total = queue.queued_total();
        let processing = queue.processing_total();
        drop(queue);

        let timing = self.inner.lock_timing();
        let terminal = timing.completed + timing.failed;
        let success_rate = if terminal > 0 {
            timing.completed as f64 / terminal as f64
        } else {
            1.0
        };
        let estimated_wait_secs = timing.avg_processing_secs * queued_total as f64
            / self.inner.config.max_concurrent_jobs.max(1) as f64;

        SchedulerStats {
            queued,
            queued_total,
            processing,
            completed: timing.completed as usize,
            failed: timing.failed as usize,
            success_rate,
            total_cost: timing.total_cost,
            avg_processing_secs: timing.avg_processing_secs,
            estimated_wait_secs,
            usage: self.inner.budget.snapshot(),
        }
    }

    // -- tick loop -----------------------------------------------------------

    /// Run the scheduler until `cancel` triggers.
    pub fn spawn(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.inner.config.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Scheduler stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        scheduler.run_tick().await;
                    }
                }
            }
        })
    }

    /// One scheduling pass: promote elapsed retries, select an admissible
    /// batch per registered type, and dispatch each batch on its own task.
    pub async fn run_tick(&self) {
        let mut dispatches = Vec::new();
        {
            let mut queue = self.inner.queue.lock().await;
            queue.promote_ready(Utc::now());

            let processors = self.inner.processors.read().await;
            for (&job_type, processor) in processors.iter() {
                let slots = self.inner.budget.available_slots();
                if slots == 0 {
                    continue;
                }
                let candidates = queue.dequeue_candidates(job_type, usize::MAX);
                if candidates.is_empty() {
                    continue;
                }

                let selected = select_batch(
                    &candidates,
                    slots,
                    &self.inner.budget,
                    self.inner.config.enable_opportunistic_fill,
                );
                if selected.is_empty() {
                    continue;
                }

                let ids: Vec<Uuid> = selected.iter().map(|(id, _)| *id).collect();
                let reservations: Vec<Reservation> =
                    selected.into_iter().map(|(_, r)| r).collect();
                let jobs = queue.begin_processing(job_type, &ids);
                tracing::debug!(
                    job_type = job_type.as_str(),
                    batch_size = jobs.len(),
                    "Batch admitted",
                );
                dispatches.push((job_type, Arc::clone(processor), jobs, reservations));
            }
        }

        for (job_type, processor, jobs, reservations) in dispatches {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner.dispatch(job_type, processor, jobs, reservations).await;
            });
        }
    }
}

impl Inner {
    async fn dispatch(
        self: Arc<Self>,
        job_type: JobType,
        processor: Arc<dyn JobProcessor>,
        jobs: Vec<Job>,
        reservations: Vec<Reservation>,
    ) {
        let outcome = processor.process(&jobs).await;

        let mut queue = self.queue.lock().await;
        match outcome {
            Ok(results) => {
                for (index, job) in jobs.iter().enumerate() {
                    if queue.take_cancelled(job.id) {
                        tracing::info!(job_id = %job.id, "Discarding result of cancelled job");
                        continue;
                    }
                    match results.get(index) {
                        Some(Ok(output)) => self.finish_success(&mut queue, job, output),
                        Some(Err(error)) => self.finish_failure(&mut queue, job, error),
                        // A processor that returned too few results failed
                        // the remainder of its batch.
                        None => self.finish_failure(
                            &mut queue,
                            job,
                            &ProcessorError::Transient("processor returned no result".into()),
                        ),
                    }
                }
            }
            Err(error) => {
                tracing::error!(
                    job_type = job_type.as_str(),
                    error = %error,
                    batch_size = jobs.len(),
                    "Processor failed the whole batch",
                );
                for job in &jobs {
                    if queue.take_cancelled(job.id) {
                        continue;
                    }
                    self.finish_failure(&mut queue, job, &error);
                }
            }
        }
        drop(queue);
        // Reservations release here, success or failure alike.
        drop(reservations);
    }

    fn finish_success(&self, queue: &mut JobQueue, job: &Job, output: &JobOutput) {
        queue.complete(job.id, output.cost);

        let elapsed_secs = job
            .started_at
            .map(|t| (Utc::now() - t).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0)
            .max(0.0);
        let mut timing = self.lock_timing();
        timing.completed += 1;
        timing.total_cost += output.cost;
        timing.avg_processing_secs =
            incremental_mean(timing.avg_processing_secs, elapsed_secs, timing.completed);
        drop(timing);

        tracing::info!(
            job_id = %job.id,
            job_type = job.job_type.as_str(),
            cost = output.cost,
            "Job completed",
        );
        self.events.publish(PipelineEvent::JobCompleted {
            job_id: job.id,
            job_type: job.job_type,
            cost: output.cost,
        });
    }

    fn finish_failure(&self, queue: &mut JobQueue, job: &Job, error: &ProcessorError) {
        let permanent = matches!(error, ProcessorError::Permanent(_));
        if !permanent && job.can_retry() {
            if let Some(taken) = queue.take_for_retry(job.id) {
                let retried = apply_transition(taken, JobTransition::RetryScheduled);
                let delay = retry_delay(retried.retry_count, &self.config.backoff);
                let ready_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                tracing::warn!(
                    job_id = %job.id,
                    job_type = job.job_type.as_str(),
                    retry_count = retried.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job failed, retry scheduled",
                );
                self.events.publish(PipelineEvent::JobRetried {
                    job_id: job.id,
                    job_type: job.job_type,
                    retry_count: retried.retry_count,
                    delay_ms: delay.as_millis() as u64,
                });
                queue.enqueue_delayed(retried, ready_at);
            }
        } else {
            queue.fail(job.id, error.to_string());
            self.lock_timing().failed += 1;
            tracing::error!(
                job_id = %job.id,
                job_type = job.job_type.as_str(),
                retry_count = job.retry_count,
                error = %error,
                "Job failed permanently",
            );
            self.events.publish(PipelineEvent::JobFailed {
                job_id: job.id,
                job_type: job.job_type,
                error: error.to_string(),
            });
        }
    }

    fn lock_timing(&self) -> std::sync::MutexGuard<'_, Timing> {
        match self.timing.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch selection
// ---------------------------------------------------------------------------

/// Two-pass greedy admission over priority-ordered candidates.
///
/// Pass 1 walks candidates in strict priority order and stops at the first
/// job that does not fit the resource envelope, so cheaper work never
/// overtakes a heavier, higher-priority job. Pass 2 (when enabled) scans
/// the remainder and admits anything that still fits, trading strict
/// ordering for utilization.
fn select_batch(
    candidates: &[Job],
    slots: usize,
    budget: &ResourceBudget,
    opportunistic_fill: bool,
) -> Vec<(Uuid, Reservation)> {
    let mut selected = Vec::new();
    let mut blocked_at = None;

    for (index, job) in candidates.iter().enumerate() {
        if selected.len() == slots {
            return selected;
        }
        let memory = estimated_memory_mb(job.job_type, job.data.to_string().len());
        match budget.try_reserve(memory, job.cost_estimate) {
            Some(reservation) => selected.push((job.id, reservation)),
            None => {
                blocked_at = Some(index);
                break;
            }
        }
    }

    if let Some(start) = blocked_at {
        if opportunistic_fill {
            for job in candidates.iter().skip(start + 1) {
                if selected.len() == slots {
                    break;
                }
                let memory = estimated_memory_mb(job.job_type, job.data.to_string().len());
                if let Some(reservation) = budget.try_reserve(memory, job.cost_estimate) {
                    selected.push((job.id, reservation));
                }
            }
        }
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyreel_core::job::JobPriority;

    fn budget(max_memory_mb: f64) -> ResourceBudget {
        ResourceBudget::new(ResourceLimits {
            max_concurrent_jobs: 8,
            max_memory_mb,
            max_cost_per_hour: 1000.0,
        })
    }

    fn image_job(priority: JobPriority) -> Job {
        Job::new(JobType::Image, serde_json::json!({}))
            .with_priority(priority)
            .with_cost_estimate(0.04)
    }

    #[test]
    fn selection_respects_slot_count() {
        let candidates: Vec<Job> = (0..5).map(|_| image_job(JobPriority::Medium)).collect();
        let selected = select_batch(&candidates, 3, &budget(100_000.0), true);
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn strict_pass_stops_at_first_misfit() {
        // Image jobs need 256 MB base; a 300 MB budget admits exactly one,
        // and without opportunistic fill nothing may jump the blocked job.
        let candidates: Vec<Job> = (0..3).map(|_| image_job(JobPriority::Medium)).collect();
        let selected = select_batch(&candidates, 3, &budget(300.0), false);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn opportunistic_fill_admits_later_fitting_jobs() {
        // One heavy video job (512 MB) blocks the strict pass; with fill
        // enabled, the later script jobs (16 MB) are admitted anyway.
        let heavy = Job::new(JobType::Video, serde_json::json!({}))
            .with_priority(JobPriority::Urgent);
        let light_a = Job::new(JobType::Script, serde_json::json!({}));
        let light_b = Job::new(JobType::Script, serde_json::json!({}));
        let candidates = vec![heavy, light_a.clone(), light_b.clone()];

        let strict = select_batch(&candidates, 3, &budget(100.0), false);
        assert!(strict.is_empty());

        let filled = select_batch(&candidates, 3, &budget(100.0), true);
        let ids: Vec<Uuid> = filled.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![light_a.id, light_b.id]);
    }

    #[test]
    fn selection_reservations_release_on_drop() {
        let budget = budget(100_000.0);
        let candidates: Vec<Job> = (0..4).map(|_| image_job(JobPriority::Medium)).collect();
        let selected = select_batch(&candidates, 4, &budget, true);
        assert_eq!(budget.snapshot().running_jobs, 4);
        drop(selected);
        assert_eq!(budget.snapshot().running_jobs, 0);
    }
}
