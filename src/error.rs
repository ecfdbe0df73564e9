use std::io;
use thiserror::Error;

use crate::timers::TaskId;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedError {
    /// Replicated store operation failed (fetch, read, write or remove)
    #[error("Store error: {0}")]
    Store(String),

    /// Transaction begin/commit/rollback or synchronization registration failed
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// The local pool refused to arm a task
    #[error("Scheduling error: {0}")]
    Scheduling(String),

    #[error("Task {0} is already scheduled locally")]
    AlreadyScheduled(TaskId),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Cannot elect a member from an empty membership view")]
    EmptyView,

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("YAML error: {0}")]
    Yaml(String),
}

pub type Result<T> = std::result::Result<T, SchedError>;

impl SchedError {
    pub fn store(msg: impl Into<String>) -> Self {
        SchedError::Store(msg.into())
    }

    pub fn transaction(msg: impl Into<String>) -> Self {
        SchedError::Transaction(msg.into())
    }

    pub fn scheduling(msg: impl Into<String>) -> Self {
        SchedError::Scheduling(msg.into())
    }

    pub fn cluster(msg: impl Into<String>) -> Self {
        SchedError::Cluster(msg.into())
    }
}

impl From<io::Error> for SchedError {
    fn from(e: io::Error) -> Self {
        SchedError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for SchedError {
    fn from(e: serde_json::Error) -> Self {
        SchedError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for SchedError {
    fn from(e: serde_yaml::Error) -> Self {
        SchedError::Yaml(e.to_string())
    }
}
