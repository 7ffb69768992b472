//! The decision engine's adaptive tick loop.
//!
//! Each tick reads every store once, runs the rule ladder per worker,
//! applies the resulting actions, and appends them to the audit log. The
//! engine never blocks waiting for a worker's reaction; its only
//! suspension points are the tick timer and store I/O.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::intervention::{AuditLog, AuditRecord, Escalation, Intervention, InterventionKind};
use super::rules::{self, Decision, TickSnapshot};
use super::scoring::CapabilityScorer;
use super::signal::{Signal, SignalHandler};
use crate::config::EngineConfig;
use crate::error::{ForemanError, Result};
use crate::exchange::{MessageExchange, MessageKind, Recipient};
use crate::heartbeat::{FlowState, HeartbeatAggregator};
use crate::negotiation::Negotiator;
use crate::queue::{Priority, Task, TaskQueue};
use crate::worker::{WorkerProfile, WorkerRegistry, WorkerState};

/// Sender id the engine uses on the exchange.
pub const ENGINE_ID: &str = "foreman";
/// Mailbox where escalations surface for the human operator.
pub const OPERATOR_ID: &str = "operator";

#[derive(Debug)]
pub struct TickReport {
    pub flow: FlowState,
    pub actions: Vec<AuditRecord>,
    pub expired: Vec<String>,
    pub complete: bool,
}

pub struct DecisionEngine {
    queue: Arc<TaskQueue>,
    exchange: MessageExchange,
    negotiator: Arc<Negotiator>,
    aggregator: Arc<HeartbeatAggregator>,
    registry: Arc<WorkerRegistry>,
    scorer: Box<dyn CapabilityScorer>,
    audit: AuditLog,
    signals: SignalHandler,
    config: EngineConfig,
}

impl DecisionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<TaskQueue>,
        exchange: MessageExchange,
        negotiator: Arc<Negotiator>,
        aggregator: Arc<HeartbeatAggregator>,
        registry: Arc<WorkerRegistry>,
        scorer: Box<dyn CapabilityScorer>,
        audit: AuditLog,
        config: EngineConfig,
    ) -> Self {
        Self {
            queue,
            exchange,
            negotiator,
            aggregator,
            registry,
            scorer,
            audit,
            signals: SignalHandler::new(),
            config,
        }
    }

    /// Handle used by the dashboard/CLI collaborators to pause, resume,
    /// or stop the loop.
    pub fn signals(&self) -> SignalHandler {
        self.signals.clone()
    }

    /// Runs until the queue drains (or forever with `continuous`).
    pub async fn run(&self) -> Result<()> {
        let mut interval = Duration::from_secs(self.config.base_tick_secs);

        loop {
            tokio::time::sleep(interval).await;

            match self.signals.check() {
                Signal::Stop => {
                    info!("Stop signal received, ending run");
                    break;
                }
                Signal::Pause => continue,
                Signal::None => {}
            }

            let report = self.tick_at(Utc::now()).await?;
            info!(
                flow = ?report.flow,
                actions = report.actions.len(),
                expired = report.expired.len(),
                "Tick complete"
            );

            if report.complete && !self.config.continuous {
                info!("All tasks terminal, coordinator run complete");
                break;
            }

            interval = self.next_interval(report.flow, interval);
        }

        Ok(())
    }

    /// Adaptive pacing: shorten toward the floor under Blocked, stretch
    /// toward the ceiling under Flourishing, otherwise return to base.
    pub fn next_interval(&self, flow: FlowState, current: Duration) -> Duration {
        let floor = Duration::from_secs(self.config.min_tick_secs);
        let ceiling = Duration::from_secs(self.config.max_tick_secs);
        let base = Duration::from_secs(self.config.base_tick_secs);

        match flow {
            FlowState::Blocked => (current / 2).max(floor),
            FlowState::Flourishing => (current * 2).min(ceiling),
            _ => base,
        }
    }

    /// One tick: expire overdue tasks, snapshot the stores, run the rule
    /// ladder per worker, apply and audit the decisions.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let expired = self.queue.expire_overdue(now).await?;

        // Refresh the read-mostly worker mirror from heartbeats.
        let summaries = self.aggregator.summary_at(now);
        for summary in &summaries {
            if let Some(state) = summary.status {
                self.registry.update_state(&summary.worker, state);
            }
        }

        let current_phase = self.queue.current_phase();
        let snapshot = TickSnapshot {
            now,
            current_phase,
            ready: self.queue.ready_at(current_phase, now),
            tasks: self.queue.all(),
            summaries: summaries
                .into_iter()
                .map(|s| (s.worker.clone(), s))
                .collect::<HashMap<_, _>>(),
            stalled_contracts: self.negotiator.stalled(
                chrono::Duration::seconds(self.config.stall_window_secs as i64),
                now,
            ),
        };

        let mut actions = Vec::new();
        let mut claimed = HashSet::new();

        for worker in self.registry.all() {
            let Some(decision) = rules::evaluate(
                &self.config,
                self.scorer.as_ref(),
                &snapshot,
                &worker,
                &claimed,
            ) else {
                continue;
            };

            let record = self
                .apply(&worker, decision, &snapshot, &mut claimed)
                .await?;
            if let Some(record) = record {
                if !self.config.dry_run {
                    self.audit.append(&record)?;
                }
                actions.push(record);
            }
        }

        Ok(TickReport {
            flow: self.aggregator.flow_state_at(now),
            actions,
            expired,
            complete: self.queue.is_complete(),
        })
    }

    async fn apply(
        &self,
        worker: &WorkerProfile,
        decision: Decision,
        snapshot: &TickSnapshot,
        claimed: &mut HashSet<String>,
    ) -> Result<Option<AuditRecord>> {
        if self.config.dry_run {
            info!(worker = %worker.id, decision = ?decision, "Dry run, not applying");
            return Ok(None);
        }

        let record = match decision {
            Decision::Escalate { reason } => {
                error!(worker = %worker.id, reason = %reason, "Escalating to operator");
                self.send(
                    Recipient::worker(OPERATOR_ID),
                    MessageKind::Status,
                    &reason,
                    &[("worker", worker.id.as_str())],
                )?;
                AuditRecord::Escalation(Escalation::new(&worker.id, reason))
            }

            Decision::MediateConflict { partners, subject } => {
                let notice = format!(
                    "ownership conflict on '{}' between {} and {}; hold further changes until mediated",
                    subject,
                    worker.id,
                    partners.join(", ")
                );
                warn!(worker = %worker.id, subject = %subject, "Mediating ownership conflict");
                self.send(Recipient::All, MessageKind::Broadcast, &notice, &[])?;

                let mut targets = vec![worker.id.clone()];
                targets.extend(partners);
                AuditRecord::Intervention(Intervention::new(
                    InterventionKind::Mediate,
                    targets,
                    format!("overlapping ownership of '{}'", subject),
                ))
            }

            Decision::MediateContract { contract_id, name } => {
                let nudge = format!(
                    "negotiation on contract '{}' has stalled; accept the latest payload or invite mediation",
                    name
                );
                self.send(
                    Recipient::worker(&worker.id),
                    MessageKind::Request,
                    &nudge,
                    &[("contract_id", contract_id.as_str())],
                )?;
                AuditRecord::Intervention(Intervention::new(
                    InterventionKind::Mediate,
                    vec![worker.id.clone()],
                    format!("contract '{}' stalled in negotiation", name),
                ))
            }

            Decision::Dispatch { task_id } => {
                self.queue.assign_at(&task_id, &worker.id, snapshot.now).await?;
                claimed.insert(task_id.clone());
                self.registry.update_state(&worker.id, WorkerState::Busy);
                self.send(
                    Recipient::worker(&worker.id),
                    MessageKind::Request,
                    "task assigned",
                    &[("task_id", task_id.as_str())],
                )?;
                info!(worker = %worker.id, task_id = %task_id, "Task dispatched");
                AuditRecord::Dispatch {
                    worker: worker.id.clone(),
                    task_id,
                    at: snapshot.now,
                }
            }

            Decision::Inject {
                bridge_title,
                blocked_task_id,
            } => {
                let blocked = self
                    .queue
                    .get(&blocked_task_id)
                    .ok_or_else(|| ForemanError::TaskNotFound(blocked_task_id.clone()))?;
                let bridge = Task::new(bridge_title, snapshot.current_phase)
                    .with_priority(Priority::High)
                    .with_description(format!(
                        "Groundwork so '{}' can start once its dependencies clear",
                        blocked.title
                    ));
                let bridge_id = self.queue.add(bridge).await?;
                self.send(
                    Recipient::worker(&worker.id),
                    MessageKind::Request,
                    "bridging task injected for you",
                    &[("task_id", bridge_id.as_str())],
                )?;
                info!(worker = %worker.id, bridge_id = %bridge_id, blocked = %blocked_task_id, "Bridging task injected");
                AuditRecord::Intervention(Intervention::new(
                    InterventionKind::Inject,
                    vec![worker.id.clone()],
                    format!("downstream task '{}' blocked on this capability", blocked.title),
                ))
            }

            Decision::Redirect { task_id } => {
                let guidance = "quality trend is negative; pause expansion, consolidate what works, and report blockers";
                self.send(
                    Recipient::worker(&worker.id),
                    MessageKind::Request,
                    guidance,
                    &[],
                )?;
                if let Some(task_id) = &task_id {
                    self.try_reprioritize(task_id, Priority::High).await?;
                }
                AuditRecord::Intervention(Intervention::new(
                    InterventionKind::Redirect,
                    vec![worker.id.clone()],
                    "momentum strongly negative below functional quality",
                ))
            }

            Decision::Amplify {
                needing_worker,
                offer,
                task_id,
            } => {
                let notice = format!(
                    "{} has spare capacity on '{}'; {} should pull from it",
                    worker.id, offer, needing_worker
                );
                self.send(Recipient::All, MessageKind::Broadcast, &notice, &[])?;
                if let Some(task_id) = &task_id {
                    self.try_reprioritize(task_id, Priority::High).await?;
                }
                AuditRecord::Intervention(Intervention::new(
                    InterventionKind::Amplify,
                    vec![worker.id.clone(), needing_worker],
                    format!("surplus capacity on '{}' matches declared need", offer),
                ))
            }

            Decision::Prune { task_ids } => {
                for task_id in &task_ids {
                    self.try_reprioritize(task_id, Priority::Low).await?;
                }
                let clarification = format!(
                    "declared scope covers {} tasks beyond the current phase; stay on phase {} work",
                    task_ids.len(),
                    snapshot.current_phase
                );
                self.send(
                    Recipient::worker(&worker.id),
                    MessageKind::Request,
                    &clarification,
                    &[],
                )?;
                AuditRecord::Intervention(Intervention::new(
                    InterventionKind::Prune,
                    vec![worker.id.clone()],
                    "declared scope exceeds the current phase objective",
                ))
            }
        };

        Ok(Some(record))
    }

    /// Priority changes may race a task reaching a terminal state; that is
    /// benign and logged, while store failures stay fatal.
    async fn try_reprioritize(&self, task_id: &str, priority: Priority) -> Result<()> {
        match self.queue.reprioritize(task_id, priority).await {
            Ok(()) => Ok(()),
            Err(ForemanError::InvalidTransition { .. }) | Err(ForemanError::TaskNotFound(_)) => {
                warn!(task_id, "Skipping reprioritize, task no longer mutable");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn send(
        &self,
        recipient: Recipient,
        kind: MessageKind,
        content: &str,
        metadata: &[(&str, &str)],
    ) -> Result<()> {
        let metadata = metadata
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.exchange
            .send(ENGINE_ID, recipient, kind, content, metadata)?;
        Ok(())
    }
}
