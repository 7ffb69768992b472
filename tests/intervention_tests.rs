//! Engine intervention paths: inject, amplify, prune.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use foreman::config::{EngineConfig, HeartbeatConfig, QueueConfig};
use foreman::engine::{AuditLog, AuditRecord, DecisionEngine, InterventionKind, KeywordScorer};
use foreman::exchange::MessageExchange;
use foreman::heartbeat::{Heartbeat, HeartbeatAggregator};
use foreman::negotiation::Negotiator;
use foreman::queue::{Priority, Task, TaskQueue, TaskStatus};
use foreman::store::AtomicWriter;
use foreman::worker::{WorkerProfile, WorkerRegistry, WorkerState};

struct Fixture {
    _dir: TempDir,
    queue: Arc<TaskQueue>,
    exchange: MessageExchange,
    negotiator: Arc<Negotiator>,
    aggregator: Arc<HeartbeatAggregator>,
    engine: DecisionEngine,
}

fn fixture(workers: Vec<WorkerProfile>) -> Fixture {
    let dir = TempDir::new().unwrap();
    let writer = AtomicWriter::new(1, StdDuration::from_millis(10));

    let queue = Arc::new(TaskQueue::new(
        dir.path().join("tasks.yaml"),
        QueueConfig::default(),
        writer.clone(),
    ));
    let exchange = MessageExchange::new(dir.path().join("messages.db")).unwrap();
    let negotiator = Arc::new(Negotiator::new(dir.path().join("contracts"), writer.clone()));
    let aggregator = Arc::new(HeartbeatAggregator::new(
        dir.path().join("heartbeats"),
        HeartbeatConfig::default(),
        writer,
    ));
    let registry = Arc::new(WorkerRegistry::new(workers));
    for worker in registry.ids() {
        aggregator.register(&worker);
    }

    let engine = DecisionEngine::new(
        Arc::clone(&queue),
        exchange.clone(),
        Arc::clone(&negotiator),
        Arc::clone(&aggregator),
        registry,
        Box::new(KeywordScorer),
        AuditLog::new(dir.path().join("audit.jsonl")),
        EngineConfig::default(),
    );

    Fixture {
        _dir: dir,
        queue,
        exchange,
        negotiator,
        aggregator,
        engine,
    }
}

fn count_kind(actions: &[AuditRecord], kind: InterventionKind) -> usize {
    actions
        .iter()
        .filter(|a| matches!(a, AuditRecord::Intervention(i) if i.kind == kind))
        .count()
}

/// An idle specialist with no matching ready work, but downstream work
/// blocked behind unmet dependencies, receives an injected bridging task.
/// A second tick does not inject a duplicate.
#[tokio::test]
async fn inject_bridging_task_once() {
    let fx = fixture(vec![
        WorkerProfile::new("w1", "backend").with_capabilities(vec!["api".to_string()])
    ]);
    let now = Utc::now();

    // Finish phase 1 so phase 2 becomes current.
    fx.queue.add(Task::new("bootstrap", 1).with_id("t0")).await.unwrap();
    fx.queue.assign("t0", "w1").await.unwrap();
    fx.queue.complete("t0", "done").await.unwrap();

    fx.queue
        .add(Task::new("schema design", 2).with_id("a"))
        .await
        .unwrap();
    fx.queue
        .add(
            Task::new("api endpoints", 2)
                .with_id("b")
                .with_dependencies(vec!["a".to_string()]),
        )
        .await
        .unwrap();

    fx.aggregator
        .record(Heartbeat::new("w1", WorkerState::Idle, 0.7).at(now))
        .await
        .unwrap();

    let report = fx.engine.tick_at(now).await.unwrap();
    assert_eq!(count_kind(&report.actions, InterventionKind::Inject), 1);

    let bridge = fx
        .queue
        .all()
        .into_iter()
        .find(|t| t.title.starts_with("Bridge:"))
        .expect("bridging task should exist");
    assert_eq!(bridge.phase, 2);
    assert_eq!(bridge.priority, Priority::High);

    // Second tick: the open bridging task suppresses re-injection, and
    // the worker instead gets dispatched onto it.
    let later = now + Duration::seconds(5);
    fx.aggregator
        .record(Heartbeat::new("w1", WorkerState::Idle, 0.7).at(later))
        .await
        .unwrap();
    let report = fx.engine.tick_at(later).await.unwrap();
    assert_eq!(count_kind(&report.actions, InterventionKind::Inject), 0);
}

/// A surging worker whose offers match another worker's needs triggers an
/// AMPLIFY broadcast and raises the needing worker's task priority.
#[tokio::test]
async fn amplify_surplus_capacity() {
    let fx = fixture(vec![
        WorkerProfile::new("w1", "backend"),
        WorkerProfile::new("w2", "frontend"),
    ]);
    let now = Utc::now();

    fx.queue
        .add(Task::new("wire the settings page", 1).with_id("t2").with_priority(Priority::Low))
        .await
        .unwrap();

    fx.aggregator
        .record(
            Heartbeat::new("w1", WorkerState::Busy, 0.5)
                .with_offers(vec!["schema".to_string()])
                .at(now - Duration::seconds(30)),
        )
        .await
        .unwrap();
    fx.aggregator
        .record(
            Heartbeat::new("w1", WorkerState::Busy, 0.9)
                .with_offers(vec!["schema".to_string()])
                .at(now),
        )
        .await
        .unwrap();
    fx.aggregator
        .record(
            Heartbeat::new("w2", WorkerState::Busy, 0.6)
                .with_task("t2")
                .with_needs(vec!["schema".to_string()])
                .at(now),
        )
        .await
        .unwrap();

    let report = fx.engine.tick_at(now).await.unwrap();
    assert_eq!(count_kind(&report.actions, InterventionKind::Amplify), 1);

    // Related task raised to High, broadcast visible to the fleet.
    assert_eq!(fx.queue.get("t2").unwrap().priority, Priority::High);
    assert!(fx
        .exchange
        .get_unread("w2")
        .unwrap()
        .iter()
        .any(|m| m.is_broadcast() && m.content.contains("schema")));
}

/// A worker claiming future-phase work gets pruned: the excess tasks are
/// de-scoped to Low and the worker receives a clarification.
#[tokio::test]
async fn prune_future_phase_claims() {
    let fx = fixture(vec![WorkerProfile::new("w1", "backend")]);
    let now = Utc::now();

    fx.queue
        .add(Task::new("current phase work", 1).with_id("t1"))
        .await
        .unwrap();
    fx.queue
        .add(Task::new("dashboard polish", 3).with_id("t7"))
        .await
        .unwrap();

    fx.aggregator
        .record(
            Heartbeat::new("w1", WorkerState::Busy, 0.7)
                .with_offers(vec!["dashboard".to_string()])
                .at(now),
        )
        .await
        .unwrap();

    let report = fx.engine.tick_at(now).await.unwrap();
    assert_eq!(count_kind(&report.actions, InterventionKind::Prune), 1);

    assert_eq!(fx.queue.get("t7").unwrap().priority, Priority::Low);
    assert_eq!(fx.queue.get("t7").unwrap().status, TaskStatus::Pending);
    assert!(!fx.exchange.get_unread("w1").unwrap().is_empty());
}

/// A contract idle in Negotiating beyond the stall window draws a
/// mediation nudge aimed at its proposer.
#[tokio::test]
async fn stalled_negotiation_mediates() {
    let fx = fixture(vec![WorkerProfile::new("w1", "backend")]);

    let id = fx
        .negotiator
        .propose(
            "EventFormat",
            foreman::negotiation::ContractKind::Interface,
            "w1",
            serde_json::json!({"v": 1}),
        )
        .await
        .unwrap();
    fx.negotiator
        .counter_propose(&id, "w2", serde_json::json!({"v": 2}))
        .await
        .unwrap();

    let stall = EngineConfig::default().stall_window_secs as i64;
    let later = Utc::now() + Duration::seconds(stall + 5);

    // Keep the proposer alive so rule 1 does not shadow rule 3.
    fx.aggregator
        .record(Heartbeat::new("w1", WorkerState::Busy, 0.7).at(later))
        .await
        .unwrap();

    let report = fx.engine.tick_at(later).await.unwrap();
    assert_eq!(count_kind(&report.actions, InterventionKind::Mediate), 1);

    let nudges = fx.exchange.get_unread("w1").unwrap();
    assert!(nudges
        .iter()
        .any(|m| m.metadata.get("contract_id") == Some(&id)));
}

/// Dry run evaluates the ladder but mutates nothing.
#[tokio::test]
async fn dry_run_applies_nothing() {
    let dir = TempDir::new().unwrap();
    let writer = AtomicWriter::new(1, StdDuration::from_millis(10));
    let queue = Arc::new(TaskQueue::new(
        dir.path().join("tasks.yaml"),
        QueueConfig::default(),
        writer.clone(),
    ));
    let exchange = MessageExchange::new(dir.path().join("messages.db")).unwrap();
    let negotiator = Arc::new(Negotiator::new(dir.path().join("contracts"), writer.clone()));
    let aggregator = Arc::new(HeartbeatAggregator::new(
        dir.path().join("heartbeats"),
        HeartbeatConfig::default(),
        writer,
    ));
    let registry = Arc::new(WorkerRegistry::new(vec![
        WorkerProfile::new("w1", "backend").with_capabilities(vec!["database".to_string()])
    ]));
    aggregator.register("w1");

    let config = EngineConfig {
        dry_run: true,
        ..EngineConfig::default()
    };
    let engine = DecisionEngine::new(
        Arc::clone(&queue),
        exchange.clone(),
        negotiator,
        Arc::clone(&aggregator),
        registry,
        Box::new(KeywordScorer),
        AuditLog::new(dir.path().join("audit.jsonl")),
        config,
    );

    let now = Utc::now();
    queue
        .add(Task::new("database migration", 1).with_id("t1"))
        .await
        .unwrap();
    aggregator
        .record(Heartbeat::new("w1", WorkerState::Idle, 0.7).at(now))
        .await
        .unwrap();

    let report = engine.tick_at(now).await.unwrap();
    assert!(report.actions.is_empty());
    assert_eq!(queue.get("t1").unwrap().status, TaskStatus::Pending);
    assert!(exchange.get_unread("w1").unwrap().is_empty());
}
