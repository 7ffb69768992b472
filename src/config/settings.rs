use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ForemanError, Result};
use crate::queue::Priority;
use crate::worker::WorkerProfile;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForemanConfig {
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub heartbeat: HeartbeatConfig,
    pub engine: EngineConfig,
    /// Worker roster: the fixed set of workers this run coordinates.
    pub workers: Vec<WorkerProfile>,
}

impl ForemanConfig {
    pub async fn load(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join("config.toml");
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, state_dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = state_dir.join("config.toml");
        let content =
            toml::to_string_pretty(self).map_err(|e| ForemanError::Config(e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Validates values for consistency. Collects every problem rather
    /// than stopping at the first.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.queue.backoff_secs.is_empty() {
            errors.push("queue.backoff_secs must not be empty");
        }
        if self
            .queue
            .backoff_secs
            .windows(2)
            .any(|pair| pair[0] > pair[1])
        {
            errors.push("queue.backoff_secs must be ascending");
        }

        if self.heartbeat.expected_interval_secs == 0 {
            errors.push("heartbeat.expected_interval_secs must be greater than 0");
        }
        if self.heartbeat.history_len < 2 {
            errors.push("heartbeat.history_len must be at least 2 (momentum needs two samples)");
        }
        if self.heartbeat.dead_after_intervals <= self.heartbeat.stale_after_intervals {
            errors.push("heartbeat.dead_after_intervals must exceed stale_after_intervals");
        }
        if !(0.0..=1.0).contains(&self.heartbeat.flow.converging_quality) {
            errors.push("heartbeat.flow.converging_quality must be between 0.0 and 1.0");
        }

        if self.engine.min_tick_secs == 0 || self.engine.min_tick_secs > self.engine.base_tick_secs
        {
            errors.push("engine.min_tick_secs must be in 1..=base_tick_secs");
        }
        if self.engine.max_tick_secs < self.engine.base_tick_secs {
            errors.push("engine.max_tick_secs must be at least base_tick_secs");
        }
        if !(0.0..=1.0).contains(&self.engine.functional_quality) {
            errors.push("engine.functional_quality must be between 0.0 and 1.0");
        }
        if self.engine.strong_negative_momentum >= 0.0 {
            errors.push("engine.strong_negative_momentum must be negative");
        }
        if self.engine.strong_positive_momentum <= 0.0 {
            errors.push("engine.strong_positive_momentum must be positive");
        }
        if self.engine.max_parallel_tasks == 0 {
            errors.push("engine.max_parallel_tasks must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ForemanError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub state_dir: PathBuf,
    pub write_retries: u32,
    pub write_retry_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".foreman"),
            write_retries: 3,
            write_retry_delay_ms: 100,
        }
    }
}

impl StoreConfig {
    pub fn tasks_path(&self) -> PathBuf {
        self.state_dir.join("tasks.yaml")
    }

    pub fn messages_path(&self) -> PathBuf {
        self.state_dir.join("messages.db")
    }

    pub fn contracts_dir(&self) -> PathBuf {
        self.state_dir.join("contracts")
    }

    pub fn heartbeats_dir(&self) -> PathBuf {
        self.state_dir.join("heartbeats")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.state_dir.join("audit.jsonl")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_retries: u32,
    /// Fixed ascending retry schedule, indexed by attempt.
    pub backoff_secs: Vec<u64>,
    pub critical_timeout_secs: u64,
    pub high_timeout_secs: u64,
    pub medium_timeout_secs: u64,
    pub low_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_secs: vec![5, 15, 30],
            critical_timeout_secs: 300,
            high_timeout_secs: 600,
            medium_timeout_secs: 1200,
            low_timeout_secs: 2400,
        }
    }
}

impl QueueConfig {
    /// Per-task timeout, derived from priority.
    pub fn timeout_for(&self, priority: Priority) -> Duration {
        let secs = match priority {
            Priority::Critical => self.critical_timeout_secs,
            Priority::High => self.high_timeout_secs,
            Priority::Medium => self.medium_timeout_secs,
            Priority::Low => self.low_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub expected_interval_secs: u64,
    /// Stale at this many expected intervals without a heartbeat.
    pub stale_after_intervals: f64,
    /// Dead at this many expected intervals without a heartbeat.
    pub dead_after_intervals: f64,
    /// Rolling snapshots retained per worker.
    pub history_len: usize,
    pub flow: FlowConfig,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            expected_interval_secs: 30,
            stale_after_intervals: 1.0,
            dead_after_intervals: 3.0,
            history_len: 10,
            flow: FlowConfig::default(),
        }
    }
}

/// Flow-state classification boundaries. Tunable policy, deliberately not
/// constants in the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub flourishing_momentum: f64,
    pub stalled_epsilon: f64,
    pub converging_quality: f64,
    pub blocked_unhealthy_workers: usize,
    pub blocked_unmet_needs: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            flourishing_momentum: 0.05,
            stalled_epsilon: 0.01,
            converging_quality: 0.8,
            blocked_unhealthy_workers: 1,
            blocked_unmet_needs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub base_tick_secs: u64,
    pub min_tick_secs: u64,
    pub max_tick_secs: u64,
    /// A Negotiating contract idle this long is considered stalled.
    pub stall_window_secs: u64,
    pub strong_negative_momentum: f64,
    pub strong_positive_momentum: f64,
    /// Quality below this is treated as non-functional output.
    pub functional_quality: f64,
    /// Future-phase ownership claims tolerated before PRUNE fires.
    pub scope_allowance: usize,
    /// Ceiling on concurrently InProgress tasks across the fleet.
    pub max_parallel_tasks: usize,
    /// Log interventions without applying them.
    pub dry_run: bool,
    /// Keep ticking after the queue drains.
    pub continuous: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_tick_secs: 5,
            min_tick_secs: 1,
            max_tick_secs: 30,
            stall_window_secs: 120,
            strong_negative_momentum: -0.1,
            strong_positive_momentum: 0.1,
            functional_quality: 0.6,
            scope_allowance: 0,
            max_parallel_tasks: 4,
            dry_run: false,
            continuous: false,
        }
    }
}
