//! Duration, cost, and memory heuristics per job type.
//!
//! Providers are metered but their true cost is only known to the caller as
//! an estimate; these defaults are used whenever a submitter does not supply
//! its own numbers, and the memory heuristic feeds the scheduler's
//! admission control.

// ---------------------------------------------------------------------------
// Per-type defaults
// ---------------------------------------------------------------------------

/// Default expected processing duration, seconds.
pub fn default_duration_secs(job_type: crate::job::JobType) -> f64 {
    use crate::job::JobType;
    match job_type {
        JobType::Image => 15.0,
        JobType::Audio => 10.0,
        JobType::Video => 120.0,
        JobType::Script => 5.0,
    }
}

/// Default estimated cost per call, currency units.
pub fn default_cost(job_type: crate::job::JobType) -> f64 {
    use crate::job::JobType;
    match job_type {
        JobType::Image => 0.04,
        JobType::Audio => 0.02,
        JobType::Video => 0.50,
        JobType::Script => 0.01,
    }
}

/// Base working-set size per in-flight job of a type, MB.
pub fn base_memory_mb(job_type: crate::job::JobType) -> f64 {
    use crate::job::JobType;
    match job_type {
        JobType::Image => 256.0,
        JobType::Audio => 64.0,
        JobType::Video => 512.0,
        JobType::Script => 16.0,
    }
}

/// Additional MB charged per KB of serialized payload.
const MEMORY_MB_PER_PAYLOAD_KB: f64 = 0.25;

/// Estimated memory for running one job: type base plus a term proportional
/// to the serialized payload size.
pub fn estimated_memory_mb(job_type: crate::job::JobType, payload_bytes: usize) -> f64 {
    base_memory_mb(job_type) + (payload_bytes as f64 / 1024.0) * MEMORY_MB_PER_PAYLOAD_KB
}

// ---------------------------------------------------------------------------
// Incremental mean
// ---------------------------------------------------------------------------

/// Compute the incremental (online) mean after observing a new value.
///
/// Formula: `new_avg = old_avg + (new_value - old_avg) / new_count`
pub fn incremental_mean(old_avg: f64, new_value: f64, new_count: u64) -> f64 {
    old_avg + (new_value - old_avg) / new_count as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobType;

    #[test]
    fn video_costs_more_than_audio() {
        assert!(default_cost(JobType::Video) > default_cost(JobType::Audio));
        assert!(default_duration_secs(JobType::Video) > default_duration_secs(JobType::Audio));
    }

    #[test]
    fn memory_ordering_video_audio_script() {
        assert!(base_memory_mb(JobType::Video) > base_memory_mb(JobType::Audio));
        assert!(base_memory_mb(JobType::Audio) > base_memory_mb(JobType::Script));
    }

    #[test]
    fn memory_grows_with_payload() {
        let small = estimated_memory_mb(JobType::Image, 0);
        let large = estimated_memory_mb(JobType::Image, 1024 * 1024);
        assert!((small - 256.0).abs() < f64::EPSILON);
        assert!(large > small);
        // 1 MB payload at 0.25 MB per KB adds 256 MB.
        assert!((large - 512.0).abs() < 1e-9);
    }

    #[test]
    fn incremental_mean_matches_batch_mean() {
        // Values 10, 20, 30: running mean must end at 20.
        let avg1 = incremental_mean(0.0, 10.0, 1);
        let avg2 = incremental_mean(avg1, 20.0, 2);
        let avg3 = incremental_mean(avg2, 30.0, 3);
        assert!((avg3 - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn incremental_mean_stable_on_repeats() {
        assert!((incremental_mean(10.0, 10.0, 7) - 10.0).abs() < f64::EPSILON);
    }
}
