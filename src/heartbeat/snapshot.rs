use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::worker::WorkerState;

/// Latest-wins progress snapshot self-reported by a worker.
///
/// `quality` is worker-asserted and treated as a heuristic signal, not
/// ground truth; only contract verification carries an independent check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker: String,
    pub status: WorkerState,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub progress: String,
    pub quality: f64,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub offers: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Heartbeat {
    pub fn new(worker: impl Into<String>, status: WorkerState, quality: f64) -> Self {
        Self {
            worker: worker.into(),
            status,
            current_task: None,
            progress: String::new(),
            quality: quality.clamp(0.0, 1.0),
            needs: Vec::new(),
            offers: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.current_task = Some(task_id.into());
        self
    }

    pub fn with_progress(mut self, progress: impl Into<String>) -> Self {
        self.progress = progress.into();
        self
    }

    pub fn with_needs(mut self, needs: Vec<String>) -> Self {
        self.needs = needs;
        self
    }

    pub fn with_offers(mut self, offers: Vec<String>) -> Self {
        self.offers = offers;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
