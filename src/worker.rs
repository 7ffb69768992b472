//! Read-mostly mirror of the external worker fleet.
//!
//! Workers execute out of process; the coordinator only tracks a profile
//! per worker (role, capabilities) and the latest observed state, updated
//! from heartbeats and task assignment.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Error,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerProfile {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_state")]
    pub state: WorkerState,
}

fn default_state() -> WorkerState {
    WorkerState::Idle
}

impl WorkerProfile {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            capabilities: Vec::new(),
            state: WorkerState::Idle,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(tag))
    }
}

/// Registry of known workers. The roster is fixed at startup; only the
/// observed state changes afterwards.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerProfile>>,
}

impl WorkerRegistry {
    pub fn new(roster: Vec<WorkerProfile>) -> Self {
        let workers = roster.into_iter().map(|w| (w.id.clone(), w)).collect();
        Self {
            workers: RwLock::new(workers),
        }
    }

    pub fn get(&self, id: &str) -> Option<WorkerProfile> {
        self.workers.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<WorkerProfile> {
        let mut workers: Vec<_> = self.workers.read().values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.workers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn update_state(&self, id: &str, state: WorkerState) {
        if let Some(worker) = self.workers.write().get_mut(id) {
            if worker.state != state {
                debug!(worker = id, from = %worker.state, to = %state, "Worker state changed");
            }
            worker.state = state;
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.workers.read().contains_key(id)
    }
}
