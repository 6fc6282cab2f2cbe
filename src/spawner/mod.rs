//! Task creation, budget admission and executor-driven transitions.

pub mod dispatch;
pub mod state_machine;

pub use dispatch::{DispatchHandle, Dispatcher, ExitOutcome, ProcessDispatcher};
pub use state_machine::{TaskEvent, TaskStateMachine};

use anyhow::anyhow;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::activity::ActivityLog;
use crate::clock::Clock;
use crate::definitions::AgentRegistry;
use crate::error::{DroverError, Result};
use crate::escalation::EscalationEvaluator;
use crate::ledger::CostLedger;
use crate::storage::{Store, TaskFilter, UpdateOutcome};
use crate::types::{
    ActivityCategory, ActivityEvent, ActorType, EscalationTrigger, SpawnRequest, Task, TaskId,
    TaskUpdate,
};

const MAX_CAS_ATTEMPTS: usize = 8;

#[derive(Clone)]
pub struct TaskSpawner {
    registry: Arc<AgentRegistry>,
    ledger: Arc<CostLedger>,
    escalation: EscalationEvaluator,
    store: Arc<dyn Store>,
    activity: ActivityLog,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
}

impl TaskSpawner {
    pub fn new(
        registry: Arc<AgentRegistry>,
        ledger: Arc<CostLedger>,
        store: Arc<dyn Store>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            escalation: EscalationEvaluator::new(registry.clone()),
            activity: ActivityLog::new(store.clone()),
            registry,
            ledger,
            store,
            dispatcher,
            clock,
        }
    }

    /// Admits, persists and dispatches a unit of work for `agent_id`.
    ///
    /// The estimate is charged to the ledger at admission. When the budget
    /// would be overrun the task is either recorded as escalated to the
    /// controller or rejected with `BudgetExceeded`, depending on whether the
    /// agent escalates on `cost_exceeded`.
    pub async fn create(&self, agent_id: &str, request: SpawnRequest) -> Result<Task> {
        let agent = self.registry.get(agent_id)?;
        let estimate = self.registry.estimate_cost(agent_id, request.tokens)?;
        let now = self.clock.now();

        let charged_on = self.clock.today();
        match self.ledger.try_spend(agent_id, estimate) {
            Ok(_) => {}
            Err(DroverError::BudgetExceeded { remaining, .. }) => {
                return self
                    .escalate_or_reject(agent_id, &request, estimate, remaining)
                    .await;
            }
            Err(e) => return Err(e),
        }

        let task = Task::pending(agent_id, &request, estimate, now);
        if let Err(e) = self.store.create_task(&task).await {
            if let Err(release) = self.ledger.release(agent_id, estimate, charged_on) {
                log::warn!("Could not release charge for {}: {}", agent_id, release);
            }
            return Err(e.into());
        }

        let mut spawned = ActivityEvent::new(
            agent_id,
            agent.actor_type(),
            ActivityCategory::Agent,
            "spawn",
            format!("Spawned task {}: {}", task.id, task.work),
        )
        .at(now)
        .with_cost(estimate)
        .with_metadata("taskId", task.id.to_string())
        .with_metadata("tokens", request.tokens);
        if let Some(area) = &request.area {
            spawned = spawned.with_area(area.as_str());
        }
        self.activity.record(spawned).await;

        match self.dispatcher.dispatch(&task).await {
            Ok(handle) => Ok(self.supervise(task, handle).await),
            Err(e) => Err(self.dispatch_failed(task, format!("{:#}", e)).await),
        }
    }

    async fn escalate_or_reject(
        &self,
        agent_id: &str,
        request: &SpawnRequest,
        estimate: Decimal,
        remaining: Decimal,
    ) -> Result<Task> {
        let trigger = EscalationTrigger::CostExceeded;
        if !self.escalation.should_escalate(agent_id, trigger)? {
            log::info!(
                "Rejected task for {}: estimate {} over remaining {}",
                agent_id,
                estimate,
                remaining
            );
            return Err(DroverError::BudgetExceeded {
                agent_id: agent_id.to_string(),
                requested: estimate,
                remaining,
            });
        }

        let now = self.clock.now();
        let target = self.escalation.escalation_target();
        let reason = format!(
            "{}: estimate {} exceeds remaining budget {}",
            trigger, estimate, remaining
        );
        let task = Task::escalated(agent_id, request, estimate, now, reason.as_str(), target.as_str());
        self.store.create_task(&task).await?;

        log::info!("Escalated task {} from {} to {}", task.id, agent_id, target);
        let agent = self.registry.get(agent_id)?;
        let event = ActivityEvent::new(
            agent_id,
            agent.actor_type(),
            ActivityCategory::Agent,
            "escalate",
            format!("Escalated to {}: {}", target, reason),
        )
        .at(now)
        .with_metadata("taskId", task.id.to_string())
        .with_metadata("trigger", trigger.as_str())
        .with_metadata("escalatedTo", target.as_str())
        .with_metadata("estimatedCost", estimate.to_string());
        self.activity.record(event).await;

        Ok(task)
    }

    /// Records the executor pid and, when the dispatcher reports exits,
    /// watches for an executor that dies without finishing its task.
    async fn supervise(&self, task: Task, handle: DispatchHandle) -> Task {
        let mut task = task;
        if let Some(pid) = handle.pid {
            match self.record_pid(task.id, pid).await {
                Ok(Some(updated)) => task = updated,
                Ok(None) => {}
                Err(e) => log::warn!("Could not record pid for task {}: {}", task.id, e),
            }
        }

        if let Some(completion) = handle.completion {
            let spawner = self.clone();
            let task_id = task.id;
            tokio::spawn(async move {
                let Ok(outcome) = completion.await else {
                    return;
                };
                if let Err(e) = spawner.reconcile_exit(task_id, outcome).await {
                    log::warn!("Could not reconcile exit of task {}: {}", task_id, e);
                }
            });
        }

        task
    }

    async fn record_pid(&self, task_id: TaskId, pid: u32) -> Result<Option<Task>> {
        let update = TaskUpdate {
            executor_pid: Some(pid),
            ..Default::default()
        };
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(task) = self.store.get_task(task_id).await? else {
                return Ok(None);
            };
            if task.is_terminal() {
                return Ok(None);
            }
            if let UpdateOutcome::Applied(task) =
                self.store.update_task(task_id, task.status, &update).await?
            {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// The task exists but never reached an executor. The charge stays.
    async fn dispatch_failed(&self, task: Task, reason: String) -> DroverError {
        log::warn!("Dispatch of task {} failed: {}", task.id, reason);

        let update = TaskUpdate {
            escalation_reason: Some(reason.clone()),
            completed_at: Some(self.clock.now()),
            ..Default::default()
        };
        if let Err(e) = self.transition(task.id, TaskEvent::DispatchFailed, update).await {
            log::warn!("Could not mark task {} failed: {}", task.id, e);
        }

        let event = ActivityEvent::system(
            ActivityCategory::Task,
            "dispatch_failed",
            format!("Task {} for {} was not dispatched: {}", task.id, task.agent_id, reason),
        )
        .with_metadata("taskId", task.id.to_string())
        .with_metadata("agentId", task.agent_id.as_str());
        self.activity.record(event).await;

        DroverError::DispatchFailed {
            task_id: task.id,
            reason,
        }
    }

    /// Validates `event` against the stored status and applies `update` with
    /// compare-and-set, retrying when another writer got there first.
    async fn transition(
        &self,
        task_id: TaskId,
        event: TaskEvent,
        mut update: TaskUpdate,
    ) -> Result<Task> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let task = self
                .store
                .get_task(task_id)
                .await?
                .ok_or(DroverError::TaskNotFound(task_id))?;
            update.status = Some(TaskStateMachine::next(task.status, event)?);

            match self.store.update_task(task_id, task.status, &update).await? {
                UpdateOutcome::Applied(task) => return Ok(task),
                UpdateOutcome::Conflict(_) => continue,
                UpdateOutcome::NotFound => return Err(DroverError::TaskNotFound(task_id)),
            }
        }

        Err(DroverError::Storage(anyhow!(
            "task {} changed under {} attempts to apply {}",
            task_id,
            MAX_CAS_ATTEMPTS,
            event.as_str()
        )))
    }

    fn task_event(&self, task: &Task, action: &str, description: String) -> ActivityEvent {
        let actor_type = self
            .registry
            .get(&task.agent_id)
            .map(|a| a.actor_type())
            .unwrap_or(ActorType::Subagent);
        ActivityEvent::new(
            task.agent_id.as_str(),
            actor_type,
            ActivityCategory::Task,
            action,
            description,
        )
        .with_metadata("taskId", task.id.to_string())
    }

    pub async fn start(&self, task_id: TaskId) -> Result<Task> {
        let task = self
            .transition(task_id, TaskEvent::Start, TaskUpdate::default())
            .await?;
        let event = self.task_event(&task, "start", format!("Started task {}", task.id));
        self.activity.record(event).await;
        Ok(task)
    }

    pub async fn report_progress(&self, task_id: TaskId, progress: u8) -> Result<Task> {
        let update = TaskUpdate {
            progress: Some(progress.min(100)),
            ..Default::default()
        };
        self.transition(task_id, TaskEvent::Progress, update).await
    }

    /// Actual cost is recorded on the task and the completion event only; the
    /// ledger keeps the admission estimate.
    pub async fn complete(&self, task_id: TaskId, actual_cost: Option<Decimal>) -> Result<Task> {
        let update = TaskUpdate {
            actual_cost,
            progress: Some(100),
            completed_at: Some(self.clock.now()),
            ..Default::default()
        };
        let task = self.transition(task_id, TaskEvent::Complete, update).await?;

        let mut event = self
            .task_event(&task, "complete", format!("Completed task {}", task.id))
            .with_metadata("estimatedCost", task.estimated_cost.to_string());
        if let Some(actual) = task.actual_cost {
            event = event.with_metadata("actualCost", actual.to_string());
        }
        self.activity.record(event).await;
        Ok(task)
    }

    pub async fn fail(&self, task_id: TaskId, reason: impl Into<String>) -> Result<Task> {
        let reason = reason.into();
        let update = TaskUpdate {
            escalation_reason: Some(reason.clone()),
            completed_at: Some(self.clock.now()),
            ..Default::default()
        };
        let task = self.transition(task_id, TaskEvent::Fail, update).await?;

        let event = self.task_event(&task, "fail", format!("Task {} failed: {}", task.id, reason));
        self.activity.record(event).await;
        Ok(task)
    }

    /// Called when a supervised executor exits. A task the executor already
    /// finished is left alone; anything still open is failed.
    pub async fn reconcile_exit(&self, task_id: TaskId, outcome: ExitOutcome) -> Result<Option<Task>> {
        let task = self.get(task_id).await?;
        if task.is_terminal() {
            return Ok(None);
        }

        let reason = if outcome.success {
            "executor exited without reporting completion".to_string()
        } else {
            outcome.reason()
        };
        let update = TaskUpdate {
            escalation_reason: Some(reason.clone()),
            completed_at: Some(self.clock.now()),
            ..Default::default()
        };

        match self.transition(task_id, TaskEvent::ExecutorExited, update).await {
            Ok(task) => {
                log::warn!("Task {} failed on executor exit: {}", task_id, reason);
                let event = self
                    .task_event(&task, "fail", format!("Task {} failed: {}", task.id, reason))
                    .with_metadata("exitCode", outcome.code);
                self.activity.record(event).await;
                Ok(Some(task))
            }
            // Finished by the executor between our read and write.
            Err(DroverError::InvalidTransition { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, task_id: TaskId) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(DroverError::TaskNotFound(task_id))
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        Ok(self.store.list_tasks(filter).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{ActivityFilter, InMemoryStore};
    use crate::test_support::{local_time, BrokenStore};
    use crate::types::TaskStatus;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct CountingDispatcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Dispatcher for CountingDispatcher {
        async fn dispatch(&self, task: &Task) -> anyhow::Result<DispatchHandle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DispatchHandle {
                task_id: task.id,
                pid: Some(4242),
                completion: None,
            })
        }
    }

    struct FailingDispatcher;

    #[async_trait]
    impl Dispatcher for FailingDispatcher {
        async fn dispatch(&self, _task: &Task) -> anyhow::Result<DispatchHandle> {
            anyhow::bail!("executor binary missing")
        }
    }

    /// Reports an exit as soon as the task is dispatched.
    struct ExitingDispatcher {
        outcome: ExitOutcome,
    }

    #[async_trait]
    impl Dispatcher for ExitingDispatcher {
        async fn dispatch(&self, task: &Task) -> anyhow::Result<DispatchHandle> {
            let (tx, rx) = oneshot::channel();
            tx.send(self.outcome.clone()).ok();
            Ok(DispatchHandle {
                task_id: task.id,
                pid: None,
                completion: Some(rx),
            })
        }
    }

    struct Fixture {
        spawner: TaskSpawner,
        ledger: Arc<CostLedger>,
        store: Arc<InMemoryStore>,
    }

    fn fixture_with(dispatcher: Arc<dyn Dispatcher>) -> Fixture {
        let registry = Arc::new(AgentRegistry::builtin().unwrap());
        let clock = Arc::new(ManualClock::new(local_time(2026, 7, 14, 10, 0)));
        let ledger = Arc::new(CostLedger::new(registry.clone(), clock.clone()));
        let store = Arc::new(InMemoryStore::new());
        let spawner = TaskSpawner::new(registry, ledger.clone(), store.clone(), dispatcher, clock);
        Fixture {
            spawner,
            ledger,
            store,
        }
    }

    fn fixture() -> (Fixture, Arc<CountingDispatcher>) {
        let dispatcher = Arc::new(CountingDispatcher::default());
        (fixture_with(dispatcher.clone()), dispatcher)
    }

    async fn events(store: &InMemoryStore) -> Vec<ActivityEvent> {
        store
            .list_activities(&ActivityFilter::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_spawn_charges_and_records() {
        let (f, dispatcher) = fixture();

        let request = SpawnRequest::new("summarise changelog", 1_000_000).with_area("docs");
        let task = f.spawner.create("garion", request).await.unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.estimated_cost, dec!(3.00));
        assert_eq!(task.executor_pid, Some(4242));
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.ledger.spent_today("garion").unwrap(), dec!(3.00));

        let events = events(&f.store).await;
        assert_eq!(events.len(), 1);
        let spawn = &events[0];
        assert!(spawn.is(ActivityCategory::Agent, "spawn"));
        assert_eq!(spawn.actor, "garion");
        assert_eq!(spawn.cost, Some(dec!(3.00)));
        assert_eq!(spawn.area(), Some("docs"));
        assert_eq!(spawn.metadata["taskId"], task.id.to_string());
    }

    #[tokio::test]
    async fn test_over_budget_escalates_to_controller() {
        let (f, dispatcher) = fixture();
        f.ledger.spend("fury", dec!(6)).unwrap();

        // 300k tokens at 0.015 per 1K is 4.50 against 4.00 remaining.
        let task = f
            .spawner
            .create("fury", SpawnRequest::new("refactor scheduler", 300_000))
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Escalated);
        assert_eq!(task.escalated_to.as_deref(), Some("belgarath"));
        assert!(task.escalation_reason.unwrap().starts_with("cost_exceeded"));
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.ledger.spent_today("fury").unwrap(), dec!(6));

        let events = events(&f.store).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is(ActivityCategory::Agent, "escalate"));
        assert_eq!(events[0].metadata["escalatedTo"], "belgarath");
        assert!(events[0].cost.is_none());
    }

    #[tokio::test]
    async fn test_over_budget_without_trigger_is_rejected() {
        let (f, _) = fixture();
        f.ledger.spend("silk", dec!(8)).unwrap();

        let err = f
            .spawner
            .create("silk", SpawnRequest::new("scan logs", 1000))
            .await
            .unwrap_err();

        assert!(matches!(err, DroverError::BudgetExceeded { .. }));
        assert!(f.store.list_tasks(&TaskFilter::default()).await.unwrap().is_empty());
        assert!(events(&f.store).await.is_empty());
    }

    #[tokio::test]
    async fn test_controller_never_escalates() {
        let (f, _) = fixture();
        f.ledger.spend("belgarath", dec!(50)).unwrap();

        let err = f
            .spawner
            .create("belgarath", SpawnRequest::new("plan", 1000))
            .await
            .unwrap_err();
        assert!(matches!(err, DroverError::BudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let (f, _) = fixture();
        let err = f
            .spawner
            .create("zedar", SpawnRequest::new("anything", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, DroverError::UnknownAgent(_)));
    }

    #[tokio::test]
    async fn test_concurrent_admission_never_overruns() {
        let (f, _) = fixture();

        // $3 each against silk's $8.
        let creates = (0..10).map(|i| {
            f.spawner
                .create("silk", SpawnRequest::new(format!("job {}", i), 1_000_000))
        });
        let results = futures::future::join_all(creates).await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
        assert_eq!(f.ledger.spent_today("silk").unwrap(), dec!(6));
    }

    #[tokio::test]
    async fn test_dispatch_failure_marks_task_failed() {
        let f = fixture_with(Arc::new(FailingDispatcher));

        let err = f
            .spawner
            .create("barak", SpawnRequest::new("deploy", 1000))
            .await
            .unwrap_err();
        let DroverError::DispatchFailed { task_id, reason } = err else {
            panic!("expected dispatch failure, got {:?}", err);
        };
        assert!(reason.contains("executor binary missing"));

        let task = f.spawner.get(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.escalation_reason, Some(reason));
        assert_eq!(f.ledger.spent_today("barak").unwrap(), dec!(0.015));

        let events = events(&f.store).await;
        assert!(events.iter().any(|e| e.is(ActivityCategory::Task, "dispatch_failed")));
    }

    #[tokio::test]
    async fn test_store_failure_releases_charge() {
        let registry = Arc::new(AgentRegistry::builtin().unwrap());
        let clock = Arc::new(ManualClock::new(local_time(2026, 7, 14, 10, 0)));
        let ledger = Arc::new(CostLedger::new(registry.clone(), clock.clone()));
        let spawner = TaskSpawner::new(
            registry,
            ledger.clone(),
            Arc::new(BrokenStore),
            Arc::new(CountingDispatcher::default()),
            clock,
        );

        let err = spawner
            .create("garion", SpawnRequest::new("index", 1000))
            .await
            .unwrap_err();

        assert!(matches!(err, DroverError::Storage(_)));
        assert_eq!(ledger.spent_today("garion").unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_executor_lifecycle() {
        let (f, _) = fixture();
        let task = f
            .spawner
            .create("garion", SpawnRequest::new("write tests", 10_000))
            .await
            .unwrap();

        f.spawner.start(task.id).await.unwrap();
        let task = f.spawner.report_progress(task.id, 140).await.unwrap();
        assert_eq!(task.progress, 100);

        let task = f.spawner.complete(task.id, Some(dec!(0.02))).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.actual_cost, Some(dec!(0.02)));
        assert!(task.completed_at.is_some());

        // The ledger keeps the estimate.
        assert_eq!(f.ledger.spent_today("garion").unwrap(), dec!(0.03));

        let events = events(&f.store).await;
        let complete = events
            .iter()
            .find(|e| e.is(ActivityCategory::Task, "complete"))
            .unwrap();
        assert_eq!(complete.metadata["actualCost"], "0.02");
        assert!(complete.cost.is_none());
    }

    #[tokio::test]
    async fn test_terminal_tasks_are_immutable() {
        let (f, _) = fixture();
        let task = f
            .spawner
            .create("fury", SpawnRequest::new("review", 1000))
            .await
            .unwrap();
        f.spawner.start(task.id).await.unwrap();
        let done = f.spawner.complete(task.id, None).await.unwrap();

        let err = f.spawner.fail(task.id, "late failure").await.unwrap_err();
        assert!(matches!(
            err,
            DroverError::InvalidTransition { from: TaskStatus::Completed, .. }
        ));
        assert!(f.spawner.start(task.id).await.is_err());
        assert_eq!(f.spawner.get(task.id).await.unwrap(), done);
    }

    #[tokio::test]
    async fn test_complete_requires_start() {
        let (f, _) = fixture();
        let task = f
            .spawner
            .create("fury", SpawnRequest::new("review", 1000))
            .await
            .unwrap();

        assert!(f.spawner.complete(task.id, None).await.is_err());
        assert_eq!(f.spawner.get(task.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_missing_task() {
        let (f, _) = fixture();
        let err = f.spawner.start(TaskId::new_v4()).await.unwrap_err();
        assert!(matches!(err, DroverError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_executor_exit_fails_open_task() {
        let f = fixture_with(Arc::new(ExitingDispatcher {
            outcome: ExitOutcome {
                success: false,
                code: Some(2),
                error: None,
            },
        }));

        let task = f
            .spawner
            .create("silk", SpawnRequest::new("crawl", 1000))
            .await
            .unwrap();

        let failed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = f.spawner.get(task.id).await.unwrap();
                if current.status == TaskStatus::Failed {
                    return current;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("supervisor fails the task");

        assert_eq!(
            failed.escalation_reason.as_deref(),
            Some("executor exited with status 2")
        );
    }

    #[tokio::test]
    async fn test_exit_after_completion_is_ignored() {
        let (f, _) = fixture();
        let task = f
            .spawner
            .create("silk", SpawnRequest::new("crawl", 1000))
            .await
            .unwrap();
        f.spawner.start(task.id).await.unwrap();
        f.spawner.complete(task.id, None).await.unwrap();

        let outcome = ExitOutcome {
            success: true,
            code: Some(0),
            error: None,
        };
        assert!(f.spawner.reconcile_exit(task.id, outcome).await.unwrap().is_none());
        assert_eq!(
            f.spawner.get(task.id).await.unwrap().status,
            TaskStatus::Completed
        );
    }
}
