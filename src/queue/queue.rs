//! Task queue: lifecycle, phase gating, readiness, retry scheduling.
//!
//! Tasks are never deleted; they only move toward a terminal status.
//! Every mutating call is followed by an atomic durable snapshot, so a
//! crash mid-run loses no committed transition.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::task::{Task, TaskStatus};
use crate::config::QueueConfig;
use crate::error::{ForemanError, Result};
use crate::store::AtomicWriter;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct QueueSnapshot {
    phase_floor: u32,
    next_seq: u64,
    saved_at: Option<DateTime<Utc>>,
    tasks: Vec<Task>,
}

#[derive(Debug, Default)]
struct QueueState {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    phase_floor: u32,
    next_seq: u64,
}

impl QueueState {
    fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.index.get(id).copied().map(move |i| &mut self.tasks[i])
    }

    /// Derived phase: advance past N only when every phase-N task is
    /// terminal. The persisted floor keeps the value monotonic even when a
    /// task is later injected into an earlier phase.
    fn current_phase(&self) -> u32 {
        let max_phase = self.tasks.iter().map(|t| t.phase).max().unwrap_or(1);
        let mut phase = 1;
        while phase < max_phase
            && self
                .tasks
                .iter()
                .filter(|t| t.phase == phase)
                .all(|t| t.status.is_terminal())
        {
            phase += 1;
        }
        phase.max(self.phase_floor.max(1))
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            phase_floor: self.phase_floor,
            next_seq: self.next_seq,
            saved_at: Some(Utc::now()),
            tasks: self.tasks.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStatistics {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub current_phase: u32,
}

pub struct TaskQueue {
    state: RwLock<QueueState>,
    config: QueueConfig,
    writer: AtomicWriter,
    snapshot_path: PathBuf,
}

impl TaskQueue {
    pub fn new(snapshot_path: impl AsRef<Path>, config: QueueConfig, writer: AtomicWriter) -> Self {
        Self {
            state: RwLock::new(QueueState::default()),
            config,
            writer,
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
        }
    }

    /// Restores a queue from its snapshot file, or starts empty.
    pub async fn load(
        snapshot_path: impl AsRef<Path>,
        config: QueueConfig,
        writer: AtomicWriter,
    ) -> Result<Self> {
        let queue = Self::new(snapshot_path, config, writer);
        let path = queue.snapshot_path.clone();

        if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let snapshot: QueueSnapshot = serde_yaml_bw::from_str(&content)?;

            let mut state = queue.state.write();
            state.phase_floor = snapshot.phase_floor;
            state.next_seq = snapshot.next_seq;
            for task in snapshot.tasks {
                let slot = state.tasks.len();
                state.index.insert(task.id.clone(), slot);
                state.tasks.push(task);
            }
            info!(tasks = state.tasks.len(), "Task queue restored from snapshot");
        }

        Ok(queue)
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = { self.state.read().snapshot() };
        let content = serde_yaml_bw::to_string(&snapshot)?;
        self.writer.write(&self.snapshot_path, &content).await
    }

    /// Adds a task. Rejects unknown dependency ids and dependency cycles;
    /// an undetected cycle would stall readiness forever.
    pub async fn add(&self, mut task: Task) -> Result<String> {
        {
            let mut state = self.state.write();

            if state.index.contains_key(&task.id) {
                return Err(ForemanError::InvalidTask {
                    task_id: task.id,
                    reason: "duplicate task id".to_string(),
                });
            }
            for dep in &task.dependencies {
                if !state.index.contains_key(dep) {
                    return Err(ForemanError::InvalidTask {
                        task_id: task.id.clone(),
                        reason: format!("unknown dependency: {}", dep),
                    });
                }
            }
            if has_cycle(&task, &state) {
                return Err(ForemanError::InvalidTask {
                    task_id: task.id,
                    reason: "dependency cycle".to_string(),
                });
            }

            task.seq = state.next_seq;
            state.next_seq += 1;
            let slot = state.tasks.len();
            state.index.insert(task.id.clone(), slot);
            debug!(task_id = %task.id, phase = task.phase, "Task added");
            state.tasks.push(task.clone());
        }

        self.persist().await?;
        Ok(task.id)
    }

    /// Ready tasks at `now`: phase 1 unconditionally (dependency lists are
    /// ignored there by design), later phases gated on phase and completed
    /// dependencies. Ordered by priority, creation order on ties.
    pub fn ready_at(&self, current_phase: u32, now: DateTime<Utc>) -> Vec<Task> {
        let state = self.state.read();

        let mut ready: Vec<Task> = state
            .tasks
            .iter()
            .filter(|t| t.assignable_at(now))
            .filter(|t| {
                if t.phase == 1 {
                    return true;
                }
                if t.phase > current_phase {
                    return false;
                }
                t.dependencies.iter().all(|dep| {
                    state
                        .get(dep)
                        .map(|d| d.status == TaskStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .cloned()
            .collect();

        ready.sort_by_key(|t| (t.priority.rank(), t.seq));
        ready
    }

    pub fn get_ready(&self, current_phase: u32) -> Vec<Task> {
        self.ready_at(current_phase, Utc::now())
    }

    pub async fn assign(&self, id: &str, worker: &str) -> Result<()> {
        self.assign_at(id, worker, Utc::now()).await
    }

    pub async fn assign_at(&self, id: &str, worker: &str, now: DateTime<Utc>) -> Result<()> {
        {
            let mut state = self.state.write();
            let task = state.get_mut(id).ok_or_else(|| ForemanError::TaskNotFound(id.to_string()))?;

            if !task.assignable_at(now) {
                return Err(ForemanError::InvalidTransition {
                    task_id: id.to_string(),
                    from: task.status.to_string(),
                    to: TaskStatus::InProgress.to_string(),
                });
            }

            task.status = TaskStatus::InProgress;
            task.assigned_worker = Some(worker.to_string());
            task.started_at = Some(now);
            debug!(task_id = id, worker, "Task assigned");
        }

        self.persist().await
    }

    pub async fn complete(&self, id: &str, result: &str) -> Result<()> {
        {
            let mut state = self.state.write();
            let task = state.get_mut(id).ok_or_else(|| ForemanError::TaskNotFound(id.to_string()))?;

            match task.status {
                TaskStatus::InProgress => {
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(Utc::now());
                    task.result = Some(result.to_string());
                    info!(task_id = id, "Task completed");
                }
                // Cooperative cancellation: a late result is discarded.
                TaskStatus::Cancelled => {
                    debug!(task_id = id, "Discarding late result for cancelled task");
                    return Ok(());
                }
                other => {
                    return Err(ForemanError::InvalidTransition {
                        task_id: id.to_string(),
                        from: other.to_string(),
                        to: TaskStatus::Completed.to_string(),
                    });
                }
            }
            self.advance_floor(&mut state);
        }

        self.persist().await
    }

    pub async fn fail(&self, id: &str, error: &str) -> Result<()> {
        self.fail_at(id, error, Utc::now()).await
    }

    pub async fn fail_at(&self, id: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
        {
            let mut state = self.state.write();
            let max_retries = self.config.max_retries;
            let backoff = self.config.backoff_secs.clone();
            let task = state.get_mut(id).ok_or_else(|| ForemanError::TaskNotFound(id.to_string()))?;

            match task.status {
                TaskStatus::InProgress => {
                    let attempt = task.attempt_count;
                    task.attempt_count += 1;
                    task.error = Some(error.to_string());

                    if attempt < max_retries {
                        let delay = backoff
                            .get(attempt as usize)
                            .or_else(|| backoff.last())
                            .copied()
                            .unwrap_or(0);
                        task.status = TaskStatus::Retrying;
                        task.next_eligible_at = Some(now + Duration::seconds(delay as i64));
                        warn!(
                            task_id = id,
                            attempt = task.attempt_count,
                            retry_in_secs = delay,
                            "Task failed, scheduling retry"
                        );
                    } else {
                        task.status = TaskStatus::Failed;
                        task.completed_at = Some(now);
                        warn!(task_id = id, "Task failed terminally, retry budget exhausted");
                    }
                }
                TaskStatus::Cancelled => {
                    debug!(task_id = id, "Discarding late failure for cancelled task");
                    return Ok(());
                }
                other => {
                    return Err(ForemanError::InvalidTransition {
                        task_id: id.to_string(),
                        from: other.to_string(),
                        to: TaskStatus::Failed.to_string(),
                    });
                }
            }
            self.advance_floor(&mut state);
        }

        self.persist().await
    }

    /// Cancels a task. The transition is recorded immediately; the worker
    /// executing it is only asked to stop, and any late result is
    /// discarded rather than applied.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        {
            let mut state = self.state.write();
            let task = state.get_mut(id).ok_or_else(|| ForemanError::TaskNotFound(id.to_string()))?;

            match task.status {
                TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Retrying => {
                    task.status = TaskStatus::Cancelled;
                    task.completed_at = Some(Utc::now());
                    info!(task_id = id, "Task cancelled");
                }
                other => {
                    return Err(ForemanError::InvalidTransition {
                        task_id: id.to_string(),
                        from: other.to_string(),
                        to: TaskStatus::Cancelled.to_string(),
                    });
                }
            }
            self.advance_floor(&mut state);
        }

        self.persist().await
    }

    /// Lowers a task's priority without touching its lifecycle. Used by
    /// the decision engine to de-scope work.
    pub async fn reprioritize(&self, id: &str, priority: super::Priority) -> Result<()> {
        {
            let mut state = self.state.write();
            let task = state.get_mut(id).ok_or_else(|| ForemanError::TaskNotFound(id.to_string()))?;
            if task.status.is_terminal() {
                return Err(ForemanError::InvalidTransition {
                    task_id: id.to_string(),
                    from: task.status.to_string(),
                    to: format!("priority={}", priority),
                });
            }
            task.priority = priority;
        }
        self.persist().await
    }

    /// Fails every InProgress task that outlived its per-priority timeout.
    /// Timeouts reuse the normal retry/backoff path.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let overdue: Vec<String> = {
            let state = self.state.read();
            state
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::InProgress)
                .filter(|t| {
                    t.started_at.is_some_and(|started| {
                        let limit = self.config.timeout_for(t.priority);
                        now - started > Duration::seconds(limit.as_secs() as i64)
                    })
                })
                .map(|t| t.id.clone())
                .collect()
        };

        for id in &overdue {
            self.fail_at(id, "task timeout exceeded", now).await?;
        }
        Ok(overdue)
    }

    pub fn current_phase(&self) -> u32 {
        self.state.read().current_phase()
    }

    pub fn is_complete(&self) -> bool {
        self.state
            .read()
            .tasks
            .iter()
            .all(|t| t.status.is_terminal())
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.state.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Task> {
        self.state.read().tasks.clone()
    }

    pub fn statistics(&self) -> QueueStatistics {
        let state = self.state.read();
        let mut by_status: HashMap<String, usize> = HashMap::new();
        for task in &state.tasks {
            *by_status.entry(task.status.to_string()).or_insert(0) += 1;
        }
        QueueStatistics {
            total: state.tasks.len(),
            by_status,
            current_phase: state.current_phase(),
        }
    }

    /// Ratchet the phase floor after a terminal transition. The floor only
    /// moves forward for the life of the run.
    fn advance_floor(&self, state: &mut QueueState) {
        let derived = state.current_phase();
        if derived > state.phase_floor {
            info!(phase = derived, "Phase advanced");
            state.phase_floor = derived;
        }
    }
}

/// Depth-first cycle check over the existing dependency graph plus the
/// incoming task's edges.
fn has_cycle(candidate: &Task, state: &QueueState) -> bool {
    let mut stack: Vec<&str> = candidate.dependencies.iter().map(String::as_str).collect();
    let mut visited: HashSet<&str> = HashSet::new();

    while let Some(id) = stack.pop() {
        if id == candidate.id {
            return true;
        }
        if !visited.insert(id) {
            continue;
        }
        if let Some(task) = state.get(id) {
            stack.extend(task.dependencies.iter().map(String::as_str));
        }
    }
    false
}
