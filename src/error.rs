use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForemanError {
    #[error("Invalid task {task_id}: {reason}")]
    InvalidTask { task_id: String, reason: String },

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Invalid contract state for {contract_id}: {action} requires {expected}, found {actual}")]
    InvalidContractState {
        contract_id: String,
        action: String,
        expected: String,
        actual: String,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Contract not found: {0}")]
    ContractNotFound(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Audit log error: {0}")]
    Audit(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, ForemanError>;

/// Wraps a lower-level store failure with context.
pub fn store_err_with(context: &str, err: impl std::fmt::Display) -> ForemanError {
    ForemanError::Store(format!("{}: {}", context, err))
}
