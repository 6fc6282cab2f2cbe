use serde::{Deserialize, Serialize};

use crate::error::{DroverError, Result};
use crate::types::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    Escalate,
    Start,
    Progress,
    Complete,
    Fail,
    DispatchFailed,
    ExecutorExited,
}

impl TaskEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEvent::Escalate => "escalate",
            TaskEvent::Start => "start",
            TaskEvent::Progress => "progress",
            TaskEvent::Complete => "complete",
            TaskEvent::Fail => "fail",
            TaskEvent::DispatchFailed => "dispatch_failed",
            TaskEvent::ExecutorExited => "executor_exited",
        }
    }
}

pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Status a task in `from` moves to on `event`. Terminal tasks accept
    /// nothing.
    pub fn next(from: TaskStatus, event: TaskEvent) -> Result<TaskStatus> {
        let next = match (from, event) {
            (TaskStatus::Pending, TaskEvent::Escalate) => TaskStatus::Escalated,
            (TaskStatus::Pending, TaskEvent::Start) => TaskStatus::Running,
            (TaskStatus::Running, TaskEvent::Progress) => TaskStatus::Running,
            (TaskStatus::Running, TaskEvent::Complete) => TaskStatus::Completed,

            (
                TaskStatus::Pending | TaskStatus::Running,
                TaskEvent::Fail | TaskEvent::ExecutorExited,
            ) => TaskStatus::Failed,
            (TaskStatus::Pending, TaskEvent::DispatchFailed) => TaskStatus::Failed,

            _ => {
                return Err(DroverError::InvalidTransition {
                    from,
                    event: event.as_str().to_string(),
                });
            }
        };

        Ok(next)
    }
}
