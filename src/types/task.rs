use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{AgentId, TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub agent_id: AgentId,
    pub status: TaskStatus,
    pub work: String,
    pub tokens: u64,
    pub estimated_cost: Decimal,
    #[serde(default)]
    pub actual_cost: Option<Decimal>,
    #[serde(default)]
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub escalation_reason: Option<String>,
    #[serde(default)]
    pub escalated_to: Option<AgentId>,
    #[serde(default)]
    pub executor_pid: Option<u32>,
}

impl Task {
    pub fn pending(
        agent_id: impl Into<AgentId>,
        request: &SpawnRequest,
        estimated_cost: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::new_v4(),
            agent_id: agent_id.into(),
            status: TaskStatus::Pending,
            work: request.work.clone(),
            tokens: request.tokens,
            estimated_cost,
            actual_cost: None,
            progress: 0,
            started_at: now,
            completed_at: None,
            escalation_reason: None,
            escalated_to: None,
            executor_pid: None,
        }
    }

    /// A task that never reaches an executor; it is handed to `target` instead.
    pub fn escalated(
        agent_id: impl Into<AgentId>,
        request: &SpawnRequest,
        estimated_cost: Decimal,
        now: DateTime<Utc>,
        reason: impl Into<String>,
        target: impl Into<AgentId>,
    ) -> Self {
        Self {
            status: TaskStatus::Escalated,
            completed_at: Some(now),
            escalation_reason: Some(reason.into()),
            escalated_to: Some(target.into()),
            ..Self::pending(agent_id, request, estimated_cost, now)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Work handed to `TaskSpawner::create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub work: String,
    /// Token estimate the cost is derived from.
    pub tokens: u64,
    #[serde(default)]
    pub area: Option<String>,
}

impl SpawnRequest {
    pub fn new(work: impl Into<String>, tokens: u64) -> Self {
        Self {
            work: work.into(),
            tokens,
            area: None,
        }
    }

    pub fn with_area(mut self, area: impl Into<String>) -> Self {
        self.area = Some(area.into());
        self
    }
}

/// Field-level patch applied to a stored task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub actual_cost: Option<Decimal>,
    pub progress: Option<u8>,
    pub completed_at: Option<DateTime<Utc>>,
    pub escalation_reason: Option<String>,
    pub executor_pid: Option<u32>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(cost) = self.actual_cost {
            task.actual_cost = Some(cost);
        }
        if let Some(progress) = self.progress {
            task.progress = progress.min(100);
        }
        if let Some(at) = self.completed_at {
            task.completed_at = Some(at);
        }
        if let Some(reason) = &self.escalation_reason {
            task.escalation_reason = Some(reason.clone());
        }
        if let Some(pid) = self.executor_pid {
            task.executor_pid = Some(pid);
        }
    }
}
