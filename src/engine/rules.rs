//! The intervention rule ladder.
//!
//! Rules are evaluated per worker in fixed priority order; the first
//! matching rule wins that worker's tick. Evaluation is pure — it reads a
//! snapshot and returns a decision; the engine applies it.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::scoring::CapabilityScorer;
use crate::config::EngineConfig;
use crate::heartbeat::{Liveness, WorkerSummary};
use crate::negotiation::Contract;
use crate::queue::{Task, TaskStatus};
use crate::worker::{WorkerProfile, WorkerState};

/// Read-only view of the stores at the start of a tick.
pub struct TickSnapshot {
    pub now: DateTime<Utc>,
    pub current_phase: u32,
    /// Priority-ordered ready tasks.
    pub ready: Vec<Task>,
    pub tasks: Vec<Task>,
    pub summaries: HashMap<String, WorkerSummary>,
    pub stalled_contracts: Vec<Contract>,
}

impl TickSnapshot {
    fn summary(&self, worker: &str) -> Option<&WorkerSummary> {
        self.summaries.get(worker)
    }

    fn is_ready(&self, id: &str) -> bool {
        self.ready.iter().any(|t| t.id == id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Rule 1: dead worker, surfaced to the operator.
    Escalate { reason: String },
    /// Rule 2: overlapping ownership claims.
    MediateConflict {
        partners: Vec<String>,
        subject: String,
    },
    /// Rule 3: negotiation stalled.
    MediateContract { contract_id: String, name: String },
    /// Rule 4: direct dispatch of a ready task.
    Dispatch { task_id: String },
    /// Rule 5: inject a bridging task toward blocked downstream work.
    Inject {
        bridge_title: String,
        blocked_task_id: String,
    },
    /// Rule 6: declining quality, send guidance.
    Redirect { task_id: Option<String> },
    /// Rule 7: surplus capacity matching someone's needs.
    Amplify {
        needing_worker: String,
        offer: String,
        task_id: Option<String>,
    },
    /// Rule 8: scope creep beyond the current phase.
    Prune { task_ids: Vec<String> },
}

/// Runs the ladder for one worker. `claimed` holds task ids already
/// dispatched earlier in this tick so two idle workers never receive the
/// same task.
pub fn evaluate(
    config: &EngineConfig,
    scorer: &dyn CapabilityScorer,
    snapshot: &TickSnapshot,
    worker: &WorkerProfile,
    claimed: &HashSet<String>,
) -> Option<Decision> {
    dead_worker(snapshot, worker)
        .or_else(|| ownership_conflict(snapshot, worker))
        .or_else(|| contract_stall(snapshot, worker))
        .or_else(|| direct_dispatch(config, scorer, snapshot, worker, claimed))
        .or_else(|| inject_bridge(scorer, snapshot, worker))
        .or_else(|| redirect_declining(config, snapshot, worker))
        .or_else(|| amplify_surplus(config, snapshot, worker))
        .or_else(|| prune_scope(config, snapshot, worker))
}

/// Rule 1. Dead is never auto-resolved, only surfaced.
fn dead_worker(snapshot: &TickSnapshot, worker: &WorkerProfile) -> Option<Decision> {
    let summary = snapshot.summary(&worker.id)?;
    if summary.liveness == Liveness::Dead {
        Some(Decision::Escalate {
            reason: format!("worker {} is dead (no heartbeat)", worker.id),
        })
    } else {
        None
    }
}

/// Rule 2. Two or more workers claiming the same ownership tag. Fires on
/// the lexicographically first participant so one conflict yields one
/// mediation per tick.
fn ownership_conflict(snapshot: &TickSnapshot, worker: &WorkerProfile) -> Option<Decision> {
    let summary = snapshot.summary(&worker.id)?;

    for offer in &summary.offers {
        let partners: Vec<String> = snapshot
            .summaries
            .values()
            .filter(|other| other.worker != worker.id)
            .filter(|other| other.offers.iter().any(|o| o.eq_ignore_ascii_case(offer)))
            .map(|other| other.worker.clone())
            .collect();

        if !partners.is_empty() && partners.iter().all(|p| worker.id < *p) {
            return Some(Decision::MediateConflict {
                partners,
                subject: offer.clone(),
            });
        }
    }
    None
}

/// Rule 3. A contract this worker proposed has gone quiet mid-negotiation.
fn contract_stall(snapshot: &TickSnapshot, worker: &WorkerProfile) -> Option<Decision> {
    snapshot
        .stalled_contracts
        .iter()
        .find(|c| c.proposer == worker.id)
        .map(|c| Decision::MediateContract {
            contract_id: c.id.clone(),
            name: c.name.clone(),
        })
}

fn is_idle(snapshot: &TickSnapshot, worker: &WorkerProfile) -> bool {
    let observed = snapshot
        .summary(&worker.id)
        .and_then(|s| s.status)
        .unwrap_or(worker.state);
    observed == WorkerState::Idle
}

/// Rule 4. Ready tasks are priority-ordered; the first capability match
/// wins. Dispatch stops at the fleet-wide parallelism ceiling.
fn direct_dispatch(
    config: &EngineConfig,
    scorer: &dyn CapabilityScorer,
    snapshot: &TickSnapshot,
    worker: &WorkerProfile,
    claimed: &HashSet<String>,
) -> Option<Decision> {
    if !is_idle(snapshot, worker) {
        return None;
    }

    let in_progress = snapshot
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .count();
    if in_progress + claimed.len() >= config.max_parallel_tasks {
        return None;
    }

    snapshot
        .ready
        .iter()
        .filter(|t| !claimed.contains(&t.id))
        .find(|t| scorer.score(t, worker) > 0.0)
        .map(|t| Decision::Dispatch {
            task_id: t.id.clone(),
        })
}

/// Rule 5. Nothing ready matches this idle worker, but downstream work it
/// is suited for sits blocked behind unmet dependencies. Inject a
/// bridging task unless one for that target is already open.
fn inject_bridge(
    scorer: &dyn CapabilityScorer,
    snapshot: &TickSnapshot,
    worker: &WorkerProfile,
) -> Option<Decision> {
    if !is_idle(snapshot, worker) {
        return None;
    }

    let blocked = snapshot
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| t.phase <= snapshot.current_phase && !snapshot.is_ready(&t.id))
        .find(|t| scorer.score(t, worker) > 0.0)?;

    let bridge_title = bridge_title(&blocked.title);
    let already_open = snapshot
        .tasks
        .iter()
        .any(|t| t.title == bridge_title && !t.status.is_terminal());
    if already_open {
        return None;
    }

    Some(Decision::Inject {
        bridge_title,
        blocked_task_id: blocked.id.clone(),
    })
}

pub fn bridge_title(blocked_title: &str) -> String {
    format!("Bridge: unblock '{}'", blocked_title)
}

/// Rule 6. Momentum strongly negative and quality under the functional
/// threshold.
fn redirect_declining(
    config: &EngineConfig,
    snapshot: &TickSnapshot,
    worker: &WorkerProfile,
) -> Option<Decision> {
    let summary = snapshot.summary(&worker.id)?;
    let quality = summary.quality?;

    if summary.momentum <= config.strong_negative_momentum && quality < config.functional_quality {
        Some(Decision::Redirect {
            task_id: summary.current_task.clone(),
        })
    } else {
        None
    }
}

/// Rule 7. Momentum strongly positive and someone needs what this worker
/// offers.
fn amplify_surplus(
    config: &EngineConfig,
    snapshot: &TickSnapshot,
    worker: &WorkerProfile,
) -> Option<Decision> {
    let summary = snapshot.summary(&worker.id)?;
    if summary.momentum < config.strong_positive_momentum {
        return None;
    }

    for other in snapshot.summaries.values() {
        if other.worker == worker.id {
            continue;
        }
        if let Some(offer) = summary
            .offers
            .iter()
            .find(|o| other.needs.iter().any(|n| n.eq_ignore_ascii_case(o)))
        {
            return Some(Decision::Amplify {
                needing_worker: other.worker.clone(),
                offer: offer.clone(),
                task_id: other.current_task.clone(),
            });
        }
    }
    None
}

/// Rule 8. Ownership claims on work beyond the current phase's bounded
/// objective.
fn prune_scope(
    config: &EngineConfig,
    snapshot: &TickSnapshot,
    worker: &WorkerProfile,
) -> Option<Decision> {
    let summary = snapshot.summary(&worker.id)?;

    let mut task_ids: Vec<String> = Vec::new();
    for offer in &summary.offers {
        let tag = offer.to_lowercase();
        for task in snapshot
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && t.phase > snapshot.current_phase)
        {
            let matches = task.id == *offer || task.matching_text().contains(&tag);
            if matches && !task_ids.contains(&task.id) {
                task_ids.push(task.id.clone());
            }
        }
    }

    if task_ids.len() > config.scope_allowance {
        Some(Decision::Prune { task_ids })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::KeywordScorer;
    use crate::queue::Priority;

    fn summary(worker: &str) -> WorkerSummary {
        WorkerSummary {
            worker: worker.to_string(),
            liveness: Liveness::Alive,
            momentum: 0.0,
            status: Some(WorkerState::Idle),
            current_task: None,
            quality: Some(0.7),
            needs: Vec::new(),
            offers: Vec::new(),
        }
    }

    fn snapshot() -> TickSnapshot {
        TickSnapshot {
            now: Utc::now(),
            current_phase: 1,
            ready: Vec::new(),
            tasks: Vec::new(),
            summaries: HashMap::new(),
            stalled_contracts: Vec::new(),
        }
    }

    #[test]
    fn test_dead_worker_escalates_before_anything_else() {
        let mut snap = snapshot();
        let mut s = summary("w1");
        s.liveness = Liveness::Dead;
        s.momentum = -0.5;
        s.quality = Some(0.1);
        snap.summaries.insert("w1".to_string(), s);

        let worker = WorkerProfile::new("w1", "backend");
        let decision = evaluate(
            &EngineConfig::default(),
            &KeywordScorer,
            &snap,
            &worker,
            &HashSet::new(),
        );
        assert!(matches!(decision, Some(Decision::Escalate { .. })));
    }

    #[test]
    fn test_ownership_conflict_fires_once_per_pair() {
        let mut snap = snapshot();
        let mut a = summary("wa");
        a.offers = vec!["auth".to_string()];
        let mut b = summary("wb");
        b.offers = vec!["auth".to_string()];
        snap.summaries.insert("wa".to_string(), a);
        snap.summaries.insert("wb".to_string(), b);

        let config = EngineConfig::default();
        let wa = WorkerProfile::new("wa", "backend");
        let wb = WorkerProfile::new("wb", "backend");

        let first = evaluate(&config, &KeywordScorer, &snap, &wa, &HashSet::new());
        assert!(matches!(first, Some(Decision::MediateConflict { .. })));

        let second = evaluate(&config, &KeywordScorer, &snap, &wb, &HashSet::new());
        assert!(!matches!(second, Some(Decision::MediateConflict { .. })));
    }

    #[test]
    fn test_dispatch_respects_claimed_set() {
        let mut snap = snapshot();
        snap.summaries.insert("w1".to_string(), summary("w1"));
        let task = Task::new("rust refactor", 1)
            .with_id("t1")
            .with_priority(Priority::High);
        snap.ready = vec![task.clone()];
        snap.tasks = vec![task];

        let worker =
            WorkerProfile::new("w1", "backend").with_capabilities(vec!["rust".to_string()]);
        let config = EngineConfig::default();

        let decision = evaluate(&config, &KeywordScorer, &snap, &worker, &HashSet::new());
        assert_eq!(
            decision,
            Some(Decision::Dispatch {
                task_id: "t1".to_string()
            })
        );

        let mut claimed = HashSet::new();
        claimed.insert("t1".to_string());
        let decision = evaluate(&config, &KeywordScorer, &snap, &worker, &claimed);
        assert!(!matches!(decision, Some(Decision::Dispatch { .. })));
    }

    #[test]
    fn test_redirect_needs_both_signals() {
        let config = EngineConfig::default();
        let worker = WorkerProfile::new("w1", "backend");

        let mut snap = snapshot();
        let mut s = summary("w1");
        s.momentum = -0.3;
        s.quality = Some(0.5);
        s.current_task = Some("t9".to_string());
        snap.summaries.insert("w1".to_string(), s);

        let decision = evaluate(&config, &KeywordScorer, &snap, &worker, &HashSet::new());
        assert_eq!(
            decision,
            Some(Decision::Redirect {
                task_id: Some("t9".to_string())
            })
        );

        // Same momentum but functional quality: no redirect.
        let mut snap = snapshot();
        let mut s = summary("w1");
        s.momentum = -0.3;
        s.quality = Some(0.9);
        snap.summaries.insert("w1".to_string(), s);
        let decision = evaluate(&config, &KeywordScorer, &snap, &worker, &HashSet::new());
        assert_eq!(decision, None);
    }

    #[test]
    fn test_amplify_matches_needs_to_offers() {
        let config = EngineConfig::default();
        let worker = WorkerProfile::new("w1", "backend");

        let mut snap = snapshot();
        let mut fast = summary("w1");
        fast.momentum = 0.2;
        fast.offers = vec!["schema".to_string()];
        let mut needy = summary("w2");
        needy.needs = vec!["schema".to_string()];
        needy.current_task = Some("t3".to_string());
        snap.summaries.insert("w1".to_string(), fast);
        snap.summaries.insert("w2".to_string(), needy);

        let decision = evaluate(&config, &KeywordScorer, &snap, &worker, &HashSet::new());
        assert_eq!(
            decision,
            Some(Decision::Amplify {
                needing_worker: "w2".to_string(),
                offer: "schema".to_string(),
                task_id: Some("t3".to_string()),
            })
        );
    }

    #[test]
    fn test_prune_on_future_phase_claims() {
        let config = EngineConfig::default();
        let worker = WorkerProfile::new("w1", "backend");

        let mut snap = snapshot();
        snap.current_phase = 1;
        snap.tasks = vec![
            Task::new("dashboard polish", 3).with_id("t7"),
            Task::new("analytics export", 3).with_id("t8"),
        ];
        let mut s = summary("w1");
        s.offers = vec!["dashboard".to_string(), "analytics".to_string()];
        snap.summaries.insert("w1".to_string(), s);

        let decision = evaluate(&config, &KeywordScorer, &snap, &worker, &HashSet::new());
        match decision {
            Some(Decision::Prune { task_ids }) => {
                assert_eq!(task_ids.len(), 2);
            }
            other => panic!("expected prune, got {:?}", other),
        }
    }
}
