//! Per-type job queues and lifecycle bookkeeping.
//!
//! [`JobQueue`] holds pending jobs ordered for efficient selection and
//! tracks the processing/finished collections a job moves through. It is a
//! plain synchronous structure; the scheduler serializes access behind a
//! single mutex (single-writer model).
//!
//! Completed and failed job *ids* are kept permanently for dependency
//! lookups; full finished records are bounded, oldest dropped first.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use storyreel_core::job::{apply_transition, Job, JobState, JobTransition, JobType};

/// Cap on retained finished-job records (completed and failed combined).
const MAX_FINISHED_RECORDS: usize = 1000;

/// Terminal outcome retained for analytics.
#[derive(Debug, Clone)]
pub enum JobOutcomeRecord {
    Completed { job: Job, cost: f64 },
    Failed { job: Job, error: String },
}

#[derive(Default)]
pub struct JobQueue {
    /// Pending jobs per type, sorted by `(priority weight desc, created_at asc)`.
    queues: HashMap<JobType, Vec<Job>>,
    /// Retry shelf: jobs waiting out their backoff delay.
    delayed: Vec<(DateTime<Utc>, Job)>,
    /// Jobs currently dispatched to a processor.
    processing: HashMap<Uuid, Job>,
    /// In-flight jobs flagged for cooperative cancellation.
    cancelled: HashSet<Uuid>,
    /// Bounded terminal records, oldest first.
    finished: VecDeque<JobOutcomeRecord>,
    /// Ids of all completed jobs, kept for dependency resolution.
    completed_ids: HashSet<Uuid>,
    /// Ids of all permanently failed jobs.
    failed_ids: HashSet<Uuid>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    // -- submission ----------------------------------------------------------

    /// Insert a job into its type's queue and re-sort.
    ///
    /// No duplicate-id constraint is enforced; callers are responsible for
    /// idempotent submission. Jobs with unmet dependencies are demoted to
    /// low priority until the dependencies clear.
    pub fn enqueue(&mut self, job: Job) {
        let job = if job.dependencies_satisfied(&self.completed_ids) {
            job
        } else {
            apply_transition(job, JobTransition::DependenciesPending)
        };
        let queue = self.queues.entry(job.job_type).or_default();
        queue.push(job);
        Self::sort_queue(queue);
    }

    /// Shelve a retry until `ready_at`.
    pub fn enqueue_delayed(&mut self, job: Job, ready_at: DateTime<Utc>) {
        self.delayed.push((ready_at, job));
    }

    /// Move every shelved job whose delay has elapsed back into its queue.
    /// Returns the number promoted.
    pub fn promote_ready(&mut self, now: DateTime<Utc>) -> usize {
        let mut promoted = 0;
        let mut remaining = Vec::with_capacity(self.delayed.len());
        for (ready_at, job) in self.delayed.drain(..) {
            if ready_at <= now {
                let queue = self.queues.entry(job.job_type).or_default();
                queue.push(job);
                Self::sort_queue(queue);
                promoted += 1;
            } else {
                remaining.push((ready_at, job));
            }
        }
        self.delayed = remaining;
        promoted
    }

    fn sort_queue(queue: &mut [Job]) {
        queue.sort_by(|a, b| {
            b.priority
                .weight()
                .cmp(&a.priority.weight())
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
    }

    // -- selection -----------------------------------------------------------

    /// Up to `limit` queued jobs of `job_type` whose dependencies are all
    /// completed, in queue order. Blocked jobs are left untouched.
    pub fn dequeue_candidates(&self, job_type: JobType, limit: usize) -> Vec<Job> {
        let Some(queue) = self.queues.get(&job_type) else {
            return Vec::new();
        };
        queue
            .iter()
            .filter(|j| j.dependencies_satisfied(&self.completed_ids))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Atomically move the given queued jobs into the processing set,
    /// stamping their start time. Ids not found in the queue are skipped.
    pub fn begin_processing(&mut self, job_type: JobType, ids: &[Uuid]) -> Vec<Job> {
        let Some(queue) = self.queues.get_mut(&job_type) else {
            return Vec::new();
        };
        let wanted: HashSet<Uuid> = ids.iter().copied().collect();
        let mut started = Vec::with_capacity(ids.len());
        queue.retain(|job| {
            if wanted.contains(&job.id) {
                started.push(apply_transition(job.clone(), JobTransition::Started));
                false
            } else {
                true
            }
        });
        for job in &started {
            self.processing.insert(job.id, job.clone());
        }
        started
    }

    // -- completion ----------------------------------------------------------

    /// Record a successful job and restore the priority of any queued
    /// dependents whose dependencies are now fully resolved.
    pub fn complete(&mut self, job_id: Uuid, cost: f64) {
        let Some(job) = self.processing.remove(&job_id) else {
            return;
        };
        self.cancelled.remove(&job_id);
        let job = apply_transition(job, JobTransition::Completed);
        self.completed_ids.insert(job_id);
        self.push_finished(JobOutcomeRecord::Completed { job, cost });
        self.restore_unblocked_dependents();
    }

    /// Record a permanent failure.
    pub fn fail(&mut self, job_id: Uuid, error: impl Into<String>) {
        let Some(job) = self.processing.remove(&job_id) else {
            return;
        };
        self.cancelled.remove(&job_id);
        let job = apply_transition(job, JobTransition::Failed);
        self.failed_ids.insert(job_id);
        self.push_finished(JobOutcomeRecord::Failed {
            job,
            error: error.into(),
        });
    }

    /// Pull a failed job out of processing for a retry re-enqueue. The
    /// caller applies the retry transition and shelves it.
    pub fn take_for_retry(&mut self, job_id: Uuid) -> Option<Job> {
        self.processing.remove(&job_id)
    }

    fn push_finished(&mut self, record: JobOutcomeRecord) {
        if self.finished.len() == MAX_FINISHED_RECORDS {
            self.finished.pop_front();
        }
        self.finished.push_back(record);
    }

    fn restore_unblocked_dependents(&mut self) {
        for queue in self.queues.values_mut() {
            let mut changed = false;
            for job in queue.iter_mut() {
                if job.demoted_from.is_some() && job.dependencies_satisfied(&self.completed_ids) {
                    *job = apply_transition(job.clone(), JobTransition::DependenciesCleared);
                    changed = true;
                }
            }
            if changed {
                Self::sort_queue(queue);
            }
        }
    }

    // -- cancellation --------------------------------------------------------

    /// Cancel a job.
    ///
    /// Queued (or shelved) jobs are removed immediately and `true` is
    /// returned. Running jobs are only flagged for cooperative
    /// cancellation (their in-flight call is not interrupted, but the
    /// eventual result is discarded and no retry is scheduled) and `false`
    /// is returned. Finished or unknown jobs return `false`.
    pub fn cancel(&mut self, job_id: Uuid) -> bool {
        for queue in self.queues.values_mut() {
            let before = queue.len();
            queue.retain(|j| j.id != job_id);
            if queue.len() < before {
                return true;
            }
        }
        let before = self.delayed.len();
        self.delayed.retain(|(_, j)| j.id != job_id);
        if self.delayed.len() < before {
            return true;
        }
        if self.processing.contains_key(&job_id) {
            self.cancelled.insert(job_id);
        }
        false
    }

    /// Consume the cancellation flag for a job, removing it from the
    /// processing set. Returns `true` when the job had been cancelled.
    pub fn take_cancelled(&mut self, job_id: Uuid) -> bool {
        if self.cancelled.remove(&job_id) {
            self.processing.remove(&job_id);
            true
        } else {
            false
        }
    }

    // -- inspection ----------------------------------------------------------

    /// Derive a job's state by scanning the bookkeeping collections.
    pub fn status(&self, job_id: Uuid) -> JobState {
        if self
            .queues
            .values()
            .any(|q| q.iter().any(|j| j.id == job_id))
            || self.delayed.iter().any(|(_, j)| j.id == job_id)
        {
            return JobState::Queued;
        }
        if self.processing.contains_key(&job_id) {
            return JobState::Processing;
        }
        if self.completed_ids.contains(&job_id) {
            return JobState::Completed;
        }
        if self.failed_ids.contains(&job_id) {
            return JobState::Failed;
        }
        JobState::NotFound
    }

    /// Number of pending jobs of one type (shelved retries included).
    pub fn depth(&self, job_type: JobType) -> usize {
        self.queues.get(&job_type).map_or(0, Vec::len)
            + self
                .delayed
                .iter()
                .filter(|(_, j)| j.job_type == job_type)
                .count()
    }

    pub fn queued_total(&self) -> usize {
        self.queues.values().map(Vec::len).sum::<usize>() + self.delayed.len()
    }

    pub fn processing_total(&self) -> usize {
        self.processing.len()
    }

    pub fn completed_total(&self) -> usize {
        self.completed_ids.len()
    }

    pub fn failed_total(&self) -> usize {
        self.failed_ids.len()
    }

    /// Recent terminal records, oldest first.
    pub fn finished_records(&self) -> impl Iterator<Item = &JobOutcomeRecord> {
        self.finished.iter()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
