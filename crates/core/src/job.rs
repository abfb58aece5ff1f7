//! Job model, priority ordering, and lifecycle transitions.
//!
//! A [`Job`] is one unit of requested generation work. All lifecycle
//! bookkeeping (priority demotion while dependencies are unmet, demotion on
//! retry, restoration once dependencies clear) is expressed as pure
//! transition functions `(Job, JobTransition) -> Job` so the queue itself
//! stays free of mutation rules and the transitions are trivially testable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// JobType
// ---------------------------------------------------------------------------

/// The kind of asset a job produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Image,
    Audio,
    Video,
    Script,
}

impl JobType {
    /// All job types, in the order stages run.
    pub const ALL: [JobType; 4] = [
        JobType::Image,
        JobType::Audio,
        JobType::Video,
        JobType::Script,
    ];

    /// String form used in event names and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Image => "image",
            JobType::Audio => "audio",
            JobType::Video => "video",
            JobType::Script => "script",
        }
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One phase of the per-scene pipeline. Stages run in declaration order;
/// the video stage consumes the image stage's output for the same scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Image,
    Audio,
    Video,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Image => "image",
            Stage::Audio => "audio",
            Stage::Video => "video",
        }
    }

    /// The job type that produces this stage's assets.
    pub fn job_type(self) -> JobType {
        match self {
            Stage::Image => JobType::Image,
            Stage::Audio => JobType::Audio,
            Stage::Video => JobType::Video,
        }
    }
}

// ---------------------------------------------------------------------------
// JobPriority
// ---------------------------------------------------------------------------

/// Scheduling priority. Higher weight is dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Urgent,
    High,
    Medium,
    Low,
}

impl JobPriority {
    /// Numeric weight used for queue ordering (descending).
    pub fn weight(self) -> i32 {
        match self {
            JobPriority::Urgent => 30,
            JobPriority::High => 20,
            JobPriority::Medium => 10,
            JobPriority::Low => 0,
        }
    }

    /// The next priority down. `Low` stays `Low`.
    pub fn demoted(self) -> Self {
        match self {
            JobPriority::Urgent => JobPriority::High,
            JobPriority::High => JobPriority::Medium,
            JobPriority::Medium | JobPriority::Low => JobPriority::Low,
        }
    }
}

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Observable lifecycle state of a job, derived by scanning the queue's
/// bookkeeping collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
    NotFound,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::NotFound => "not_found",
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One unit of requested generation work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,

    /// Opaque payload handed verbatim to the registered processor.
    pub data: serde_json::Value,

    pub priority: JobPriority,

    /// When the job was demoted (unmet dependencies or retry), the priority
    /// it held before demotion, so it can be restored later.
    pub demoted_from: Option<JobPriority>,

    pub retry_count: u32,
    pub max_retries: u32,

    /// Ids of jobs that must be completed before this one may run.
    pub dependencies: Vec<Uuid>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,

    /// Caller-supplied duration estimate, seconds.
    pub estimated_duration_secs: f64,

    /// Caller-supplied cost estimate, currency units.
    pub cost_estimate: f64,
}

impl Job {
    /// Create a job with defaults suitable for direct submission.
    pub fn new(job_type: JobType, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            data,
            priority: JobPriority::Medium,
            demoted_from: None,
            retry_count: 0,
            max_retries: 3,
            dependencies: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            estimated_duration_secs: crate::estimate::default_duration_secs(job_type),
            cost_estimate: crate::estimate::default_cost(job_type),
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_cost_estimate(mut self, cost: f64) -> Self {
        self.cost_estimate = cost;
        self
    }

    /// Whether every dependency id is present in `completed`.
    pub fn dependencies_satisfied(&self, completed: &std::collections::HashSet<Uuid>) -> bool {
        self.dependencies.iter().all(|id| completed.contains(id))
    }

    /// Whether another retry attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// Lifecycle events that produce a new job value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTransition {
    /// Dependencies are unmet: demote to `Low` until they clear.
    DependenciesPending,
    /// All dependencies completed: restore the pre-demotion priority.
    DependenciesCleared,
    /// The job was dispatched to a processor.
    Started,
    /// The processor reported success.
    Completed,
    /// The attempt failed and a retry will be scheduled; demotes one step.
    RetryScheduled,
    /// The attempt failed terminally.
    Failed,
}

/// Apply a lifecycle transition, returning the updated job.
///
/// Demotions remember the original priority in `demoted_from`; restoration
/// clears it. Repeated demotions keep the earliest remembered priority so a
/// job that was `Urgent` returns to `Urgent` once unblocked.
pub fn apply_transition(mut job: Job, transition: JobTransition) -> Job {
    match transition {
        JobTransition::DependenciesPending => {
            if job.priority != JobPriority::Low {
                job.demoted_from.get_or_insert(job.priority);
                job.priority = JobPriority::Low;
            }
        }
        JobTransition::DependenciesCleared => {
            if let Some(original) = job.demoted_from.take() {
                job.priority = original;
            }
        }
        JobTransition::Started => {
            job.started_at = Some(Utc::now());
        }
        JobTransition::Completed => {
            job.completed_at = Some(Utc::now());
        }
        JobTransition::RetryScheduled => {
            // Retry demotion is one-way; `demoted_from` only tracks the
            // dependency demotion that restoration undoes.
            job.retry_count += 1;
            job.priority = job.priority.demoted();
            job.started_at = None;
        }
        JobTransition::Failed => {
            job.failed_at = Some(Utc::now());
        }
    }
    job
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
