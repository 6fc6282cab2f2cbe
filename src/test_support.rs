use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Utc};
use std::sync::{Mutex, OnceLock};
use tokio::sync::broadcast;

use crate::storage::{ActivityFilter, Store, StoreChange, TaskFilter, UpdateOutcome};
use crate::types::{
    ActivityEvent, AgentLivenessRecord, EventId, Task, TaskId, TaskStatus, TaskUpdate,
};

/// A wall-clock local time as a UTC instant.
pub(crate) fn local_time(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Local
        .with_ymd_and_hms(year, month, day, hour, minute, 0)
        .earliest()
        .expect("test times avoid DST gaps")
        .with_timezone(&Utc)
}

/// Runs `f` with environment overrides under a process-wide lock.
pub(crate) fn with_env<T>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> T) -> T {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard = LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner());

    let previous: Vec<_> = vars
        .iter()
        .map(|(name, _)| (name.to_string(), std::env::var(name).ok()))
        .collect();

    for (name, value) in vars {
        match value {
            Some(v) => std::env::set_var(name, v),
            None => std::env::remove_var(name),
        }
    }

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));

    for (name, value) in previous {
        match value {
            Some(v) => std::env::set_var(&name, v),
            None => std::env::remove_var(&name),
        }
    }

    match result {
        Ok(output) => output,
        Err(payload) => std::panic::resume_unwind(payload),
    }
}

/// Store whose every operation fails.
pub(crate) struct BrokenStore;

#[async_trait]
impl Store for BrokenStore {
    async fn get_liveness(&self, _agent_id: &str) -> Result<Option<AgentLivenessRecord>> {
        bail!("store unavailable")
    }

    async fn list_liveness(&self) -> Result<Vec<AgentLivenessRecord>> {
        bail!("store unavailable")
    }

    async fn compare_and_set_liveness(
        &self,
        _record: &AgentLivenessRecord,
        _expected_revision: Option<u64>,
    ) -> Result<bool> {
        bail!("store unavailable")
    }

    async fn create_task(&self, _task: &Task) -> Result<()> {
        bail!("store unavailable")
    }

    async fn get_task(&self, _id: TaskId) -> Result<Option<Task>> {
        bail!("store unavailable")
    }

    async fn update_task(
        &self,
        _id: TaskId,
        _expected: TaskStatus,
        _update: &TaskUpdate,
    ) -> Result<UpdateOutcome> {
        bail!("store unavailable")
    }

    async fn list_tasks(&self, _filter: &TaskFilter) -> Result<Vec<Task>> {
        bail!("store unavailable")
    }

    async fn append_activity(&self, _event: &ActivityEvent) -> Result<()> {
        bail!("store unavailable")
    }

    async fn get_activity(&self, _id: EventId) -> Result<Option<ActivityEvent>> {
        bail!("store unavailable")
    }

    async fn list_activities(&self, _filter: &ActivityFilter) -> Result<Vec<ActivityEvent>> {
        bail!("store unavailable")
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        broadcast::channel(1).1
    }
}
