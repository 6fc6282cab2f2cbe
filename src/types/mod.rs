pub mod activity;
pub mod liveness;
pub mod task;

pub use activity::{ActivityEvent, SYSTEM_ACTOR};
pub use liveness::AgentLivenessRecord;
pub use task::{SpawnRequest, Task, TaskUpdate};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::DroverError;

pub type AgentId = String;
pub type TaskId = Uuid;
pub type EventId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Escalated,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Escalated => "escalated",
        }
    }

    /// Terminal tasks are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Escalated
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "escalated" => Some(TaskStatus::Escalated),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessStatus {
    Idle,
    Active,
    Completed,
    Blocked,
    Offline,
}

impl LivenessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LivenessStatus::Idle => "idle",
            LivenessStatus::Active => "active",
            LivenessStatus::Completed => "completed",
            LivenessStatus::Blocked => "blocked",
            LivenessStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(LivenessStatus::Idle),
            "active" => Some(LivenessStatus::Active),
            "completed" => Some(LivenessStatus::Completed),
            "blocked" => Some(LivenessStatus::Blocked),
            "offline" => Some(LivenessStatus::Offline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Main,
    Subagent,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCategory {
    File,
    Web,
    Tool,
    Agent,
    Communication,
    System,
    Task,
}

impl ActivityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityCategory::File => "file",
            ActivityCategory::Web => "web",
            ActivityCategory::Tool => "tool",
            ActivityCategory::Agent => "agent",
            ActivityCategory::Communication => "communication",
            ActivityCategory::System => "system",
            ActivityCategory::Task => "task",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Code,
    Research,
    Writing,
    Review,
    Communication,
    Web,
    File,
    Delegate,
}

impl Capability {
    pub fn all() -> Vec<Self> {
        vec![
            Capability::Code,
            Capability::Research,
            Capability::Writing,
            Capability::Review,
            Capability::Communication,
            Capability::Web,
            Capability::File,
            Capability::Delegate,
        ]
    }
}

/// Conditions under which a task may be routed to the controller agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTrigger {
    CostExceeded,
    ComplexReasoningNeeded,
    UnclearTask,
    SafetyConcern,
}

impl EscalationTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationTrigger::CostExceeded => "cost_exceeded",
            EscalationTrigger::ComplexReasoningNeeded => "complex_reasoning_needed",
            EscalationTrigger::UnclearTask => "unclear_task",
            EscalationTrigger::SafetyConcern => "safety_concern",
        }
    }

    pub fn all() -> [Self; 4] {
        [
            EscalationTrigger::CostExceeded,
            EscalationTrigger::ComplexReasoningNeeded,
            EscalationTrigger::UnclearTask,
            EscalationTrigger::SafetyConcern,
        ]
    }
}

impl FromStr for EscalationTrigger {
    type Err = DroverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cost_exceeded" => Ok(EscalationTrigger::CostExceeded),
            "complex_reasoning_needed" => Ok(EscalationTrigger::ComplexReasoningNeeded),
            "unclear_task" => Ok(EscalationTrigger::UnclearTask),
            "safety_concern" => Ok(EscalationTrigger::SafetyConcern),
            other => Err(DroverError::UnknownTrigger(other.to_string())),
        }
    }
}

impl fmt::Display for EscalationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
