//! Heartbeat aggregation: liveness classification, quality momentum, and
//! the coarse system-wide flow state that paces the decision engine.
//!
//! Per worker the aggregator keeps the latest snapshot plus a bounded
//! rolling history (the only accumulating heartbeat state). Every
//! classification boundary lives in configuration.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use super::snapshot::Heartbeat;
use crate::config::HeartbeatConfig;
use crate::error::Result;
use crate::store::AtomicWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    Stale,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Flourishing,
    Flowing,
    Stalled,
    Blocked,
    Converging,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub worker: String,
    pub liveness: Liveness,
    pub momentum: f64,
    pub status: Option<crate::worker::WorkerState>,
    pub current_task: Option<String>,
    pub quality: Option<f64>,
    pub needs: Vec<String>,
    pub offers: Vec<String>,
}

#[derive(Debug)]
struct WorkerTrack {
    latest: Option<Heartbeat>,
    history: VecDeque<Heartbeat>,
    /// Registration baseline; a worker that never heartbeats still goes
    /// Stale and then Dead measured from here.
    baseline: DateTime<Utc>,
}

pub struct HeartbeatAggregator {
    tracks: RwLock<HashMap<String, WorkerTrack>>,
    config: HeartbeatConfig,
    dir: PathBuf,
    writer: AtomicWriter,
}

impl HeartbeatAggregator {
    pub fn new(dir: impl AsRef<Path>, config: HeartbeatConfig, writer: AtomicWriter) -> Self {
        Self {
            tracks: RwLock::new(HashMap::new()),
            config,
            dir: dir.as_ref().to_path_buf(),
            writer,
        }
    }

    pub fn register(&self, worker: &str) {
        self.register_at(worker, Utc::now());
    }

    pub fn register_at(&self, worker: &str, now: DateTime<Utc>) {
        self.tracks
            .write()
            .entry(worker.to_string())
            .or_insert_with(|| WorkerTrack {
                latest: None,
                history: VecDeque::new(),
                baseline: now,
            });
    }

    /// Latest-wins: overwrites the current snapshot and pushes into the
    /// rolling history, dropping the oldest beyond the configured bound.
    pub async fn record(&self, heartbeat: Heartbeat) -> Result<()> {
        let worker = heartbeat.worker.clone();
        {
            let mut tracks = self.tracks.write();
            let track = tracks
                .entry(worker.clone())
                .or_insert_with(|| WorkerTrack {
                    latest: None,
                    history: VecDeque::new(),
                    baseline: heartbeat.timestamp,
                });

            track.history.push_back(heartbeat.clone());
            while track.history.len() > self.config.history_len.max(1) {
                track.history.pop_front();
            }
            track.latest = Some(heartbeat.clone());
        }

        debug!(worker = %worker, quality = heartbeat.quality, "Heartbeat recorded");

        let content = serde_yaml_bw::to_string(&heartbeat)?;
        let path = self.dir.join(format!("{}.yaml", worker));
        self.writer.write(&path, &content).await
    }

    pub fn latest(&self, worker: &str) -> Option<Heartbeat> {
        self.tracks
            .read()
            .get(worker)
            .and_then(|t| t.latest.clone())
    }

    pub fn liveness(&self, worker: &str) -> Liveness {
        self.liveness_at(worker, Utc::now())
    }

    /// Alive under 1x the expected interval, Stale in [1x, 3x), Dead at
    /// 3x and beyond; both multipliers are configuration.
    pub fn liveness_at(&self, worker: &str, now: DateTime<Utc>) -> Liveness {
        let tracks = self.tracks.read();
        let Some(track) = tracks.get(worker) else {
            return Liveness::Dead;
        };

        let last_seen = track
            .latest
            .as_ref()
            .map(|h| h.timestamp)
            .unwrap_or(track.baseline);
        let age = (now - last_seen).num_milliseconds() as f64 / 1000.0;
        let interval = self.config.expected_interval_secs as f64;

        if age < interval * self.config.stale_after_intervals {
            Liveness::Alive
        } else if age < interval * self.config.dead_after_intervals {
            Liveness::Stale
        } else {
            Liveness::Dead
        }
    }

    /// Least-squares slope of self-reported quality across the rolling
    /// history. Neutral (0.0) below two samples.
    pub fn momentum(&self, worker: &str) -> f64 {
        let tracks = self.tracks.read();
        let Some(track) = tracks.get(worker) else {
            return 0.0;
        };

        let qualities: Vec<f64> = track.history.iter().map(|h| h.quality).collect();
        slope(&qualities)
    }

    /// Needs tags the rest of the fleet does not currently offer,
    /// declared in at least the last two snapshots.
    pub fn persistent_unmet_needs(&self, worker: &str) -> Vec<String> {
        let tracks = self.tracks.read();
        let Some(track) = tracks.get(worker) else {
            return Vec::new();
        };
        if track.history.len() < 2 {
            return Vec::new();
        }

        let latest = &track.history[track.history.len() - 1];
        let previous = &track.history[track.history.len() - 2];

        latest
            .needs
            .iter()
            .filter(|need| previous.needs.contains(need))
            .filter(|need| {
                !tracks.iter().any(|(other, other_track)| {
                    other.as_str() != worker
                        && other_track
                            .latest
                            .as_ref()
                            .is_some_and(|h| h.offers.iter().any(|o| o.eq_ignore_ascii_case(need)))
                })
            })
            .cloned()
            .collect()
    }

    pub fn flow_state(&self) -> FlowState {
        self.flow_state_at(Utc::now())
    }

    /// Coarse fleet-wide classification. Thresholds come from
    /// `FlowConfig`; the relative ordering of checks is: distress first
    /// (Blocked), then clear positives (Flourishing, Converging), then
    /// flat momentum (Stalled), else Flowing.
    pub fn flow_state_at(&self, now: DateTime<Utc>) -> FlowState {
        let workers: Vec<String> = self.tracks.read().keys().cloned().collect();
        if workers.is_empty() {
            return FlowState::Flowing;
        }

        let flow = &self.config.flow;
        let mut unhealthy = 0usize;
        let mut unmet = 0usize;
        let mut momenta = Vec::new();
        let mut qualities = Vec::new();

        for worker in &workers {
            match self.liveness_at(worker, now) {
                Liveness::Alive => {}
                Liveness::Stale | Liveness::Dead => unhealthy += 1,
            }
            if !self.persistent_unmet_needs(worker).is_empty() {
                unmet += 1;
            }
            momenta.push(self.momentum(worker));
            if let Some(h) = self.latest(worker) {
                qualities.push(h.quality);
            }
        }

        let avg_momentum = momenta.iter().sum::<f64>() / momenta.len() as f64;
        let avg_quality = if qualities.is_empty() {
            0.0
        } else {
            qualities.iter().sum::<f64>() / qualities.len() as f64
        };

        if unhealthy >= flow.blocked_unhealthy_workers || unmet >= flow.blocked_unmet_needs {
            FlowState::Blocked
        } else if avg_momentum >= flow.flourishing_momentum && unmet == 0 && unhealthy == 0 {
            FlowState::Flourishing
        } else if avg_quality >= flow.converging_quality && avg_momentum >= 0.0 {
            FlowState::Converging
        } else if avg_momentum.abs() < flow.stalled_epsilon && avg_quality < flow.converging_quality
        {
            FlowState::Stalled
        } else {
            FlowState::Flowing
        }
    }

    pub fn summary_at(&self, now: DateTime<Utc>) -> Vec<WorkerSummary> {
        let mut workers: Vec<String> = self.tracks.read().keys().cloned().collect();
        workers.sort();

        workers
            .into_iter()
            .map(|worker| {
                let latest = self.latest(&worker);
                WorkerSummary {
                    liveness: self.liveness_at(&worker, now),
                    momentum: self.momentum(&worker),
                    status: latest.as_ref().map(|h| h.status),
                    current_task: latest.as_ref().and_then(|h| h.current_task.clone()),
                    quality: latest.as_ref().map(|h| h.quality),
                    needs: latest.as_ref().map(|h| h.needs.clone()).unwrap_or_default(),
                    offers: latest.as_ref().map(|h| h.offers.clone()).unwrap_or_default(),
                    worker,
                }
            })
            .collect()
    }

    pub fn workers(&self) -> Vec<String> {
        let mut workers: Vec<String> = self.tracks.read().keys().cloned().collect();
        workers.sort();
        workers
    }
}

/// Least-squares slope of `values` against their indices.
fn slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }

    let mean_x = (n - 1) as f64 / 2.0;
    let mean_y = values.iter().sum::<f64>() / n as f64;

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }

    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}
