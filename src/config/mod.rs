//! Runtime configuration.

mod settings;

pub use settings::{
    EngineConfig, FlowConfig, ForemanConfig, HeartbeatConfig, QueueConfig, StoreConfig,
};
