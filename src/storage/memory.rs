use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use super::traits::{ActivityFilter, Store, StoreChange, TaskFilter, UpdateOutcome};
use crate::types::{
    ActivityEvent, AgentId, AgentLivenessRecord, EventId, Task, TaskId, TaskStatus, TaskUpdate,
};

pub const DEFAULT_CHANGE_CAPACITY: usize = 1024;

#[derive(Default)]
struct ActivityTable {
    events: Vec<ActivityEvent>,
    index: HashMap<EventId, usize>,
}

#[derive(Clone)]
pub struct InMemoryStore {
    liveness: Arc<RwLock<HashMap<AgentId, AgentLivenessRecord>>>,
    tasks: Arc<RwLock<HashMap<TaskId, Task>>>,
    activities: Arc<RwLock<ActivityTable>>,
    changes: broadcast::Sender<StoreChange>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANGE_CAPACITY)
    }

    /// `capacity` bounds how far a subscriber may fall behind before it lags.
    pub fn with_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            liveness: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            activities: Arc::new(RwLock::new(ActivityTable::default())),
            changes,
        }
    }

    fn publish(&self, change: StoreChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_liveness(&self, agent_id: &str) -> Result<Option<AgentLivenessRecord>> {
        let liveness = self
            .liveness
            .read()
            .map_err(|_| anyhow!("liveness table lock poisoned"))?;
        Ok(liveness.get(agent_id).cloned())
    }

    async fn list_liveness(&self) -> Result<Vec<AgentLivenessRecord>> {
        let liveness = self
            .liveness
            .read()
            .map_err(|_| anyhow!("liveness table lock poisoned"))?;
        let mut records: Vec<_> = liveness.values().cloned().collect();
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(records)
    }

    async fn compare_and_set_liveness(
        &self,
        record: &AgentLivenessRecord,
        expected_revision: Option<u64>,
    ) -> Result<bool> {
        let stored = {
            let mut liveness = self
                .liveness
                .write()
                .map_err(|_| anyhow!("liveness table lock poisoned"))?;

            let current = liveness.get(&record.agent_id).map(|r| r.revision);
            if current != expected_revision {
                return Ok(false);
            }

            let mut stored = record.clone();
            stored.revision = expected_revision.map_or(1, |r| r + 1);
            liveness.insert(stored.agent_id.clone(), stored.clone());
            stored
        };

        self.publish(StoreChange::Liveness(stored));
        Ok(true)
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        {
            let mut tasks = self
                .tasks
                .write()
                .map_err(|_| anyhow!("task table lock poisoned"))?;
            if tasks.contains_key(&task.id) {
                bail!("task {} already exists", task.id);
            }
            tasks.insert(task.id, task.clone());
        }

        self.publish(StoreChange::Task(task.clone()));
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let tasks = self
            .tasks
            .read()
            .map_err(|_| anyhow!("task table lock poisoned"))?;
        Ok(tasks.get(&id).cloned())
    }

    async fn update_task(
        &self,
        id: TaskId,
        expected: TaskStatus,
        update: &TaskUpdate,
    ) -> Result<UpdateOutcome> {
        let updated = {
            let mut tasks = self
                .tasks
                .write()
                .map_err(|_| anyhow!("task table lock poisoned"))?;

            let Some(task) = tasks.get_mut(&id) else {
                return Ok(UpdateOutcome::NotFound);
            };
            if task.status != expected {
                return Ok(UpdateOutcome::Conflict(task.clone()));
            }

            update.apply(task);
            task.clone()
        };

        self.publish(StoreChange::Task(updated.clone()));
        Ok(UpdateOutcome::Applied(updated))
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let tasks = self
            .tasks
            .read()
            .map_err(|_| anyhow!("task table lock poisoned"))?;

        let mut matching: Vec<Task> = tasks
            .values()
            .filter(|t| filter.agent_id.as_ref().map_or(true, |a| &t.agent_id == a))
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        matching.sort_by_key(|t| t.started_at);
        Ok(matching)
    }

    async fn append_activity(&self, event: &ActivityEvent) -> Result<()> {
        {
            let mut activities = self
                .activities
                .write()
                .map_err(|_| anyhow!("activity table lock poisoned"))?;
            if activities.index.contains_key(&event.id) {
                bail!("activity {} already recorded", event.id);
            }
            let position = activities.events.len();
            activities.index.insert(event.id, position);
            activities.events.push(event.clone());
        }

        self.publish(StoreChange::Activity(event.clone()));
        Ok(())
    }

    async fn get_activity(&self, id: EventId) -> Result<Option<ActivityEvent>> {
        let activities = self
            .activities
            .read()
            .map_err(|_| anyhow!("activity table lock poisoned"))?;
        Ok(activities
            .index
            .get(&id)
            .map(|&i| activities.events[i].clone()))
    }

    async fn list_activities(&self, filter: &ActivityFilter) -> Result<Vec<ActivityEvent>> {
        let activities = self
            .activities
            .read()
            .map_err(|_| anyhow!("activity table lock poisoned"))?;

        let mut matching: Vec<ActivityEvent> = activities
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.timestamp);

        if let Some(limit) = filter.limit {
            let skip = matching.len().saturating_sub(limit);
            matching.drain(..skip);
        }
        Ok(matching)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActivityCategory, ActorType, SpawnRequest};
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn create_test_task(agent_id: &str) -> Task {
        Task::pending(
            agent_id,
            &SpawnRequest::new("test work", 1000),
            dec!(0.015),
            Utc::now(),
        )
    }

    fn create_test_event(actor: &str) -> ActivityEvent {
        ActivityEvent::new(
            actor,
            ActorType::Subagent,
            ActivityCategory::Tool,
            "run",
            "test event",
        )
    }

    #[tokio::test]
    async fn test_task_operations() {
        let store = InMemoryStore::new();
        let task = create_test_task("fury");

        store.create_task(&task).await.unwrap();

        let retrieved = store.get_task(task.id).await.unwrap();
        assert_eq!(retrieved, Some(task.clone()));

        // Same id twice is rejected.
        assert!(store.create_task(&task).await.is_err());
    }

    #[tokio::test]
    async fn test_update_task_compare_and_set() {
        let store = InMemoryStore::new();
        let task = create_test_task("fury");
        store.create_task(&task).await.unwrap();

        let outcome = store
            .update_task(task.id, TaskStatus::Pending, &TaskUpdate::status(TaskStatus::Running))
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Applied(t) if t.status == TaskStatus::Running));

        let outcome = store
            .update_task(task.id, TaskStatus::Pending, &TaskUpdate::status(TaskStatus::Failed))
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Conflict(t) if t.status == TaskStatus::Running));

        let outcome = store
            .update_task(
                TaskId::new_v4(),
                TaskStatus::Pending,
                &TaskUpdate::status(TaskStatus::Failed),
            )
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_list_tasks_filters() {
        let store = InMemoryStore::new();
        store.create_task(&create_test_task("fury")).await.unwrap();
        store.create_task(&create_test_task("fury")).await.unwrap();
        store.create_task(&create_test_task("silk")).await.unwrap();

        let fury = store
            .list_tasks(&TaskFilter {
                agent_id: Some("fury".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(fury.len(), 2);

        let running = store
            .list_tasks(&TaskFilter {
                status: Some(TaskStatus::Running),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(running.is_empty());
    }

    #[tokio::test]
    async fn test_liveness_compare_and_set() {
        let store = InMemoryStore::new();
        let record = AgentLivenessRecord::unseen("garion");

        assert!(store.compare_and_set_liveness(&record, None).await.unwrap());
        // Creating again is a conflict.
        assert!(!store.compare_and_set_liveness(&record, None).await.unwrap());

        let stored = store.get_liveness("garion").await.unwrap().unwrap();
        assert_eq!(stored.revision, 1);

        assert!(store
            .compare_and_set_liveness(&stored, Some(1))
            .await
            .unwrap());
        assert!(!store
            .compare_and_set_liveness(&stored, Some(1))
            .await
            .unwrap());
        assert_eq!(
            store.get_liveness("garion").await.unwrap().unwrap().revision,
            2
        );
    }

    #[tokio::test]
    async fn test_activities_are_append_only() {
        let store = InMemoryStore::new();
        let event = create_test_event("silk");

        store.append_activity(&event).await.unwrap();
        assert!(store.append_activity(&event).await.is_err());
        assert_eq!(store.get_activity(event.id).await.unwrap(), Some(event));
    }

    #[tokio::test]
    async fn test_list_activities_orders_and_limits() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        // Delivered out of order.
        for offset in [3, 1, 2, 0] {
            let event = create_test_event("barak").at(now - Duration::minutes(offset));
            store.append_activity(&event).await.unwrap();
        }

        let all = store
            .list_activities(&ActivityFilter::default())
            .await
            .unwrap();
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let latest = store
            .list_activities(&ActivityFilter {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[1].timestamp, now);

        let recent = store
            .list_activities(&ActivityFilter::since(now - Duration::seconds(90)))
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn test_subscribers_see_writes() {
        let store = InMemoryStore::new();
        let mut changes = store.subscribe();

        store.append_activity(&create_test_event("fury")).await.unwrap();
        store.create_task(&create_test_task("fury")).await.unwrap();

        assert!(matches!(changes.recv().await.unwrap(), StoreChange::Activity(_)));
        assert!(matches!(changes.recv().await.unwrap(), StoreChange::Task(_)));
    }
}
