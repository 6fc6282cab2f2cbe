//! Append-only activity recorder.
//!
//! Recording is observability: a failed write is logged and swallowed so it
//! never aborts the operation that produced the event.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::storage::{ActivityFilter, Store};
use crate::types::{ActivityEvent, EventId};

#[derive(Clone)]
pub struct ActivityLog {
    store: Arc<dyn Store>,
}

impl ActivityLog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Returns the event id, or `None` if the write failed.
    pub async fn record(&self, event: ActivityEvent) -> Option<EventId> {
        let id = event.id;
        match self.store.append_activity(&event).await {
            Ok(()) => {
                log::debug!(
                    "activity {} {}/{} by {}",
                    id,
                    event.category.as_str(),
                    event.action,
                    event.actor
                );
                Some(id)
            }
            Err(e) => {
                log::warn!(
                    "Failed to record activity {}/{} for {}: {}",
                    event.category.as_str(),
                    event.action,
                    event.actor,
                    e
                );
                None
            }
        }
    }

    /// Most recent events, newest first.
    pub async fn recent(&self, limit: usize) -> anyhow::Result<Vec<ActivityEvent>> {
        let mut events = self
            .store
            .list_activities(&ActivityFilter {
                limit: Some(limit),
                ..Default::default()
            })
            .await?;
        events.reverse();
        Ok(events)
    }

    pub async fn by_actor(&self, actor: &str, limit: usize) -> anyhow::Result<Vec<ActivityEvent>> {
        let mut events = self
            .store
            .list_activities(&ActivityFilter {
                actor: Some(actor.to_string()),
                limit: Some(limit),
                ..Default::default()
            })
            .await?;
        events.reverse();
        Ok(events)
    }

    /// Everything at or after `since`, oldest first.
    pub async fn since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<ActivityEvent>> {
        self.store
            .list_activities(&ActivityFilter::since(since))
            .await
    }
}
