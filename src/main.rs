use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use foreman::cli::{apply_run_flags, Cli, Commands};
use foreman::config::ForemanConfig;
use foreman::engine::{AuditLog, DecisionEngine, KeywordScorer};
use foreman::error::Result;
use foreman::exchange::MessageExchange;
use foreman::heartbeat::HeartbeatAggregator;
use foreman::negotiation::Negotiator;
use foreman::queue::{Task, TaskQueue};
use foreman::store::{recover_interrupted_writes, AtomicWriter};
use foreman::worker::WorkerRegistry;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("foreman=debug")
    } else {
        EnvFilter::new("foreman=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let state_dir = cli.state_dir.unwrap_or_else(|| PathBuf::from(".foreman"));

    match cli.command {
        Commands::Init => cmd_init(state_dir).await,
        Commands::Run {
            dry_run,
            continuous,
            max_retries,
            timeout,
            parallelism,
        } => {
            let mut config = load_config(&state_dir).await?;
            apply_run_flags(
                &mut config,
                dry_run,
                continuous,
                max_retries,
                timeout,
                parallelism,
            );
            config.validate()?;
            cmd_run(config).await
        }
        Commands::Status => cmd_status(load_config(&state_dir).await?).await,
        Commands::Inject {
            title,
            phase,
            priority,
            description,
            deps,
        } => {
            let config = load_config(&state_dir).await?;
            let task = Task::new(title, phase)
                .with_priority(priority.into())
                .with_description(description.unwrap_or_default())
                .with_dependencies(deps);
            let queue = open_queue(&config).await?;
            let id = queue.add(task).await?;
            println!("{}", id);
            Ok(())
        }
        Commands::Cancel { task_id } => {
            let config = load_config(&state_dir).await?;
            let queue = open_queue(&config).await?;
            queue.cancel(&task_id).await?;
            println!("cancelled {}", task_id);
            Ok(())
        }
    }
}

async fn load_config(state_dir: &PathBuf) -> Result<ForemanConfig> {
    let mut config = ForemanConfig::load(state_dir).await?;
    config.store.state_dir = state_dir.clone();
    Ok(config)
}

fn writer_for(config: &ForemanConfig) -> AtomicWriter {
    AtomicWriter::new(
        config.store.write_retries,
        Duration::from_millis(config.store.write_retry_delay_ms),
    )
}

async fn open_queue(config: &ForemanConfig) -> Result<Arc<TaskQueue>> {
    Ok(Arc::new(
        TaskQueue::load(
            config.store.tasks_path(),
            config.queue.clone(),
            writer_for(config),
        )
        .await?,
    ))
}

async fn cmd_init(state_dir: PathBuf) -> Result<()> {
    tokio::fs::create_dir_all(&state_dir).await?;
    let config = ForemanConfig::default();
    config.save(&state_dir).await?;
    println!("initialized {}", state_dir.display());
    Ok(())
}

async fn cmd_run(config: ForemanConfig) -> Result<()> {
    let state_dir = &config.store.state_dir;
    tokio::fs::create_dir_all(state_dir).await?;
    recover_interrupted_writes(state_dir).await;
    recover_interrupted_writes(&config.store.contracts_dir()).await;
    recover_interrupted_writes(&config.store.heartbeats_dir()).await;

    let writer = writer_for(&config);
    let queue = open_queue(&config).await?;
    let exchange = MessageExchange::new(config.store.messages_path())?;
    let negotiator = Arc::new(Negotiator::load(config.store.contracts_dir(), writer.clone()).await?);
    let aggregator = Arc::new(HeartbeatAggregator::new(
        config.store.heartbeats_dir(),
        config.heartbeat.clone(),
        writer,
    ));

    let registry = Arc::new(WorkerRegistry::new(config.workers.clone()));
    for worker in registry.ids() {
        aggregator.register(&worker);
    }

    let engine = DecisionEngine::new(
        queue,
        exchange,
        negotiator,
        aggregator,
        registry,
        Box::new(KeywordScorer),
        AuditLog::new(config.store.audit_path()),
        config.engine.clone(),
    );

    engine.run().await
}

async fn cmd_status(config: ForemanConfig) -> Result<()> {
    let queue = open_queue(&config).await?;
    let stats = queue.statistics();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    let aggregator = HeartbeatAggregator::new(
        config.store.heartbeats_dir(),
        config.heartbeat.clone(),
        writer_for(&config),
    );
    let summaries = aggregator.summary_at(chrono::Utc::now());
    if !summaries.is_empty() {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    }
    Ok(())
}
