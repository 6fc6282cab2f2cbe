use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::types::{
    ActivityCategory, ActivityEvent, AgentLivenessRecord, EventId, Task, TaskId, TaskStatus,
    TaskUpdate,
};

/// Change notification published for every successful write.
#[derive(Debug, Clone)]
pub enum StoreChange {
    Activity(ActivityEvent),
    Task(Task),
    Liveness(AgentLivenessRecord),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied(Task),
    /// The stored task was not in the expected status; carries the current row.
    Conflict(Task),
    NotFound,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub agent_id: Option<String>,
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub actor: Option<String>,
    pub category: Option<ActivityCategory>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the most recent `limit` matches.
    pub limit: Option<usize>,
}

impl ActivityFilter {
    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &ActivityEvent) -> bool {
        self.actor.as_ref().map_or(true, |a| &event.actor == a)
            && self.category.map_or(true, |c| event.category == c)
            && self.since.map_or(true, |s| event.timestamp >= s)
    }
}

/// Collection-document contract the orchestrator depends on: `agents`
/// (liveness, mutable), `tasks` (lifecycle transitions) and `activities`
/// (append-only).
#[async_trait]
pub trait Store: Send + Sync {
    // Agent liveness
    async fn get_liveness(&self, agent_id: &str) -> Result<Option<AgentLivenessRecord>>;
    async fn list_liveness(&self) -> Result<Vec<AgentLivenessRecord>>;
    /// Writes `record` only if the stored revision equals `expected_revision`
    /// (`None` means the record must not exist yet). The stored copy gets
    /// revision `expected + 1`. Returns `false` on conflict.
    async fn compare_and_set_liveness(
        &self,
        record: &AgentLivenessRecord,
        expected_revision: Option<u64>,
    ) -> Result<bool>;

    // Tasks
    async fn create_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;
    /// Applies `update` only if the task is currently in `expected`.
    async fn update_task(
        &self,
        id: TaskId,
        expected: TaskStatus,
        update: &TaskUpdate,
    ) -> Result<UpdateOutcome>;
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    // Activities
    async fn append_activity(&self, event: &ActivityEvent) -> Result<()>;
    async fn get_activity(&self, id: EventId) -> Result<Option<ActivityEvent>>;
    /// Matching events in timestamp order, oldest first.
    async fn list_activities(&self, filter: &ActivityFilter) -> Result<Vec<ActivityEvent>>;

    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}
