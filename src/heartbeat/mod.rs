//! Worker liveness and progress aggregation.

mod aggregator;
mod snapshot;

pub use aggregator::{FlowState, HeartbeatAggregator, Liveness, WorkerSummary};
pub use snapshot::Heartbeat;
