pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod heartbeat;
pub mod negotiation;
pub mod queue;
pub mod store;
pub mod worker;

pub use config::ForemanConfig;
pub use engine::{
    AuditLog, CapabilityScorer, DecisionEngine, Intervention, InterventionKind, KeywordScorer,
};
pub use error::{ForemanError, Result};
pub use exchange::{Message, MessageExchange, MessageKind, Recipient};
pub use heartbeat::{FlowState, Heartbeat, HeartbeatAggregator, Liveness};
pub use negotiation::{Contract, ContractKind, ContractStatus, Negotiator, Verdict};
pub use queue::{Priority, Task, TaskQueue, TaskStatus};
pub use worker::{WorkerProfile, WorkerRegistry, WorkerState};
