//! Command-line surface. Flags translate into coordinator configuration
//! at startup; the runtime core never reads them directly.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::ForemanConfig;
use crate::queue::Priority;

#[derive(Parser)]
#[command(name = "foreman", about = "Coordinates independent long-running workers")]
pub struct Cli {
    /// State directory holding the durable stores.
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the state directory and a default config.
    Init,

    /// Run the coordination loop.
    Run {
        /// Evaluate rules without applying interventions.
        #[arg(long)]
        dry_run: bool,

        /// Keep ticking after the queue drains.
        #[arg(long)]
        continuous: bool,

        /// Override the retry budget per task.
        #[arg(long)]
        max_retries: Option<u32>,

        /// Override every per-priority task timeout (seconds).
        #[arg(long)]
        timeout: Option<u64>,

        /// Ceiling on concurrently running tasks.
        #[arg(long)]
        parallelism: Option<usize>,
    },

    /// Print queue statistics and worker summaries.
    Status,

    /// Add a task to the queue.
    Inject {
        title: String,

        #[arg(long, default_value_t = 1)]
        phase: u32,

        #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
        priority: PriorityArg,

        #[arg(long)]
        description: Option<String>,

        /// Dependency task ids.
        #[arg(long)]
        deps: Vec<String>,
    },

    /// Cancel a task.
    Cancel { task_id: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PriorityArg {
    Critical,
    High,
    Medium,
    Low,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Critical => Priority::Critical,
            PriorityArg::High => Priority::High,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::Low => Priority::Low,
        }
    }
}

/// Applies run-command flags onto the loaded configuration.
pub fn apply_run_flags(
    config: &mut ForemanConfig,
    dry_run: bool,
    continuous: bool,
    max_retries: Option<u32>,
    timeout: Option<u64>,
    parallelism: Option<usize>,
) {
    config.engine.dry_run = dry_run;
    config.engine.continuous = continuous;
    if let Some(retries) = max_retries {
        config.queue.max_retries = retries;
    }
    if let Some(secs) = timeout {
        config.queue.critical_timeout_secs = secs;
        config.queue.high_timeout_secs = secs;
        config.queue.medium_timeout_secs = secs;
        config.queue.low_timeout_secs = secs;
    }
    if let Some(parallel) = parallelism {
        config.engine.max_parallel_tasks = parallel;
    }
}
