use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{AgentId, TaskId, TaskStatus};

pub type Result<T> = std::result::Result<T, DroverError>;

#[derive(Error, Debug)]
pub enum DroverError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("Unknown escalation trigger: {0}")]
    UnknownTrigger(String),

    #[error("Budget exceeded for agent {agent_id}: requested {requested}, remaining {remaining}")]
    BudgetExceeded {
        agent_id: AgentId,
        requested: Decimal,
        remaining: Decimal,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid task transition from {from} on {event}")]
    InvalidTransition { from: TaskStatus, event: String },

    #[error("Dispatch failed for task {task_id}: {reason}")]
    DispatchFailed { task_id: TaskId, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl DroverError {
    /// Configuration bugs rather than runtime conditions.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DroverError::UnknownAgent(_) | DroverError::UnknownTrigger(_) | DroverError::Config(_)
        )
    }
}
