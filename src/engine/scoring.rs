//! Pluggable task/worker capability matching.
//!
//! The scheduler only sees the trait; the matching strategy can be
//! swapped without touching it.

use crate::queue::Task;
use crate::worker::WorkerProfile;

pub trait CapabilityScorer: Send + Sync {
    /// Affinity of `worker` for `task`. Zero means no match; higher is a
    /// better fit.
    fn score(&self, task: &Task, worker: &WorkerProfile) -> f64;
}

/// Keyword-overlap scoring: a capability tag appearing in the task's
/// title or description counts full weight, a role match counts half.
#[derive(Debug, Clone, Default)]
pub struct KeywordScorer;

impl CapabilityScorer for KeywordScorer {
    fn score(&self, task: &Task, worker: &WorkerProfile) -> f64 {
        let haystack = task.matching_text();
        let mut score = 0.0;

        for capability in &worker.capabilities {
            if haystack.contains(&capability.to_lowercase()) {
                score += 1.0;
            }
        }
        if !worker.role.is_empty() && haystack.contains(&worker.role.to_lowercase()) {
            score += 0.5;
        }
        score
    }
}
