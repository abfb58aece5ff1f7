//! Admission-control resource budget.
//!
//! The budget counters (concurrency slots, summed memory estimate, summed
//! cost-rate) are the only mutable state shared between pipeline runs on one
//! scheduler, so they live behind a single mutex. Reservations are RAII
//! guards: dropping one releases its share even when batch processing
//! panics or bails early, so budget can never leak.

use std::sync::{Arc, Mutex};

/// Hard resource ceilings for concurrently running jobs.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub max_concurrent_jobs: usize,
    pub max_memory_mb: f64,
    pub max_cost_per_hour: f64,
}

/// Point-in-time usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct ResourceUsage {
    pub running_jobs: usize,
    pub memory_mb: f64,
    pub cost_rate: f64,
}

/// Shared admission counters guarded by one mutex.
#[derive(Clone)]
pub struct ResourceBudget {
    limits: ResourceLimits,
    usage: Arc<Mutex<ResourceUsage>>,
}

impl ResourceBudget {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            usage: Arc::new(Mutex::new(ResourceUsage::default())),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Concurrency slots currently free.
    pub fn available_slots(&self) -> usize {
        let usage = self.lock();
        self.limits
            .max_concurrent_jobs
            .saturating_sub(usage.running_jobs)
    }

    pub fn snapshot(&self) -> ResourceUsage {
        *self.lock()
    }

    /// Try to reserve one slot plus the given memory and cost-rate share.
    ///
    /// Returns `None` without side effects when any ceiling would be
    /// exceeded. The returned [`Reservation`] releases everything on drop.
    pub fn try_reserve(&self, memory_mb: f64, cost_rate: f64) -> Option<Reservation> {
        let mut usage = self.lock();
        if usage.running_jobs + 1 > self.limits.max_concurrent_jobs {
            return None;
        }
        if usage.memory_mb + memory_mb > self.limits.max_memory_mb {
            return None;
        }
        if usage.cost_rate + cost_rate > self.limits.max_cost_per_hour {
            return None;
        }
        usage.running_jobs += 1;
        usage.memory_mb += memory_mb;
        usage.cost_rate += cost_rate;
        Some(Reservation {
            usage: Arc::clone(&self.usage),
            memory_mb,
            cost_rate,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ResourceUsage> {
        // A poisoned budget mutex would mean a panic while holding plain
        // counter updates; the counters themselves are still consistent.
        match self.usage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// One admitted job's share of the budget. Released on drop.
pub struct Reservation {
    usage: Arc<Mutex<ResourceUsage>>,
    memory_mb: f64,
    cost_rate: f64,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut usage = match self.usage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        usage.running_jobs = usage.running_jobs.saturating_sub(1);
        usage.memory_mb = (usage.memory_mb - self.memory_mb).max(0.0);
        usage.cost_rate = (usage.cost_rate - self.cost_rate).max(0.0);
    }
}
