//! Heartbeat ingestion and staleness detection.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::activity::ActivityLog;
use crate::clock::Clock;
use crate::definitions::AgentRegistry;
use crate::error::{DroverError, Result};
use crate::storage::Store;
use crate::types::{ActivityCategory, ActivityEvent, AgentId, AgentLivenessRecord, LivenessStatus};

/// Cadence executors are expected to heartbeat at.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default silence after which an agent is considered offline (3x cadence).
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(90);

const MAX_CAS_ATTEMPTS: usize = 8;

/// Applies one heartbeat to `record`.
///
/// Heartbeats can arrive out of order, so `last_heartbeat` only moves forward.
/// An offline agent comes back idle; the only hint-driven transition is
/// idle -> active.
fn apply_heartbeat(
    record: &mut AgentLivenessRecord,
    now: DateTime<Utc>,
    hint: Option<LivenessStatus>,
) {
    record.last_heartbeat = Some(record.last_heartbeat.map_or(now, |last| last.max(now)));
    record.is_online = true;

    if record.status == LivenessStatus::Offline {
        record.status = LivenessStatus::Idle;
    }
    if record.status == LivenessStatus::Idle && hint == Some(LivenessStatus::Active) {
        record.status = LivenessStatus::Active;
    }
}

#[derive(Clone)]
pub struct LivenessMonitor {
    registry: Arc<AgentRegistry>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    activity: ActivityLog,
}

impl LivenessMonitor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        activity: ActivityLog,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            activity,
        }
    }

    /// Records a heartbeat and returns its timestamp.
    pub async fn heartbeat(
        &self,
        agent_id: &str,
        hint: Option<LivenessStatus>,
    ) -> Result<DateTime<Utc>> {
        self.registry.get(agent_id)?;
        let now = self.clock.now();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.get_liveness(agent_id).await?;
            let expected = current.as_ref().map(|r| r.revision);
            let mut next = current.unwrap_or_else(|| AgentLivenessRecord::unseen(agent_id));
            let was_online = next.is_online;

            apply_heartbeat(&mut next, now, hint);

            if self.store.compare_and_set_liveness(&next, expected).await? {
                if !was_online {
                    log::info!("Agent {} is online ({})", agent_id, next.status.as_str());
                }
                return Ok(now);
            }
        }

        Err(DroverError::Storage(anyhow!(
            "heartbeat for {} lost {} consecutive write races",
            agent_id,
            MAX_CAS_ATTEMPTS
        )))
    }

    /// Marks every online agent silent for longer than `threshold` as offline.
    /// Re-derives status from `last_heartbeat`, so repeated runs are harmless.
    pub async fn check_staleness(&self, threshold: Duration) -> Result<Vec<AgentId>> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| DroverError::Config(format!("staleness threshold out of range: {}", e)))?;
        let now = self.clock.now();
        let mut went_offline = Vec::new();

        for candidate in self.store.list_liveness().await? {
            if !candidate.is_online || !candidate.is_stale(now, threshold) {
                continue;
            }
            if self.mark_offline(&candidate.agent_id, now, threshold).await? {
                went_offline.push(candidate.agent_id);
            }
        }

        for agent_id in &went_offline {
            log::warn!("Agent {} missed heartbeats; marked offline", agent_id);
            let event = ActivityEvent::system(
                ActivityCategory::System,
                "agent_offline",
                format!("{} stopped sending heartbeats", agent_id),
            )
            .at(now)
            .with_metadata("agentId", agent_id.as_str());
            self.activity.record(event).await;
        }

        Ok(went_offline)
    }

    async fn mark_offline(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
        threshold: chrono::Duration,
    ) -> Result<bool> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(mut record) = self.store.get_liveness(agent_id).await? else {
                return Ok(false);
            };
            // A heartbeat may have landed since the scan.
            if !record.is_online || !record.is_stale(now, threshold) {
                return Ok(false);
            }

            let expected = record.revision;
            record.is_online = false;
            record.status = LivenessStatus::Offline;

            if self
                .store
                .compare_and_set_liveness(&record, Some(expected))
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn record(&self, agent_id: &str) -> Result<AgentLivenessRecord> {
        self.registry.get(agent_id)?;
        Ok(self
            .store
            .get_liveness(agent_id)
            .await?
            .unwrap_or_else(|| AgentLivenessRecord::unseen(agent_id)))
    }

    /// One record per registered agent, including ones never seen.
    pub async fn snapshot(&self) -> Result<Vec<AgentLivenessRecord>> {
        let stored = self.store.list_liveness().await?;
        Ok(self
            .registry
            .iter()
            .map(|agent| {
                stored
                    .iter()
                    .find(|r| r.agent_id == agent.id)
                    .cloned()
                    .unwrap_or_else(|| AgentLivenessRecord::unseen(agent.id.as_str()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{ActivityFilter, InMemoryStore};
    use crate::test_support::{local_time, BrokenStore};

    struct Fixture {
        monitor: LivenessMonitor,
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(local_time(2026, 7, 14, 10, 0)));
        let registry = Arc::new(AgentRegistry::builtin().unwrap());
        let monitor = LivenessMonitor::new(
            registry,
            store.clone(),
            clock.clone(),
            ActivityLog::new(store.clone()),
        );
        Fixture {
            monitor,
            store,
            clock,
        }
    }

    #[tokio::test]
    async fn test_first_heartbeat_brings_agent_online() {
        let f = fixture();

        let ts = f.monitor.heartbeat("garion", None).await.unwrap();
        let record = f.monitor.record("garion").await.unwrap();

        assert!(record.is_online);
        assert_eq!(record.status, LivenessStatus::Idle);
        assert_eq!(record.last_heartbeat, Some(ts));
    }

    #[tokio::test]
    async fn test_repeated_heartbeats_are_idempotent() {
        let f = fixture();

        let mut last = None;
        for _ in 0..10 {
            f.clock.advance(chrono::Duration::seconds(30));
            last = Some(f.monitor.heartbeat("silk", None).await.unwrap());
            let record = f.monitor.record("silk").await.unwrap();
            assert!(record.is_online);
        }

        let record = f.monitor.record("silk").await.unwrap();
        assert_eq!(record.last_heartbeat, last);
        assert_eq!(record.status, LivenessStatus::Idle);
    }

    #[tokio::test]
    async fn test_concurrent_heartbeats() {
        let f = fixture();

        let beats = (0..20).map(|_| f.monitor.heartbeat("barak", None));
        let results = futures::future::join_all(beats).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let record = f.monitor.record("barak").await.unwrap();
        assert!(record.is_online);
        assert_eq!(record.revision, 20);
    }

    #[tokio::test]
    async fn test_active_hint_only_promotes_idle() {
        let f = fixture();

        f.monitor
            .heartbeat("fury", Some(LivenessStatus::Active))
            .await
            .unwrap();
        assert_eq!(
            f.monitor.record("fury").await.unwrap().status,
            LivenessStatus::Active
        );

        // Idle hints never regress an active agent.
        f.monitor
            .heartbeat("fury", Some(LivenessStatus::Idle))
            .await
            .unwrap();
        assert_eq!(
            f.monitor.record("fury").await.unwrap().status,
            LivenessStatus::Active
        );
    }

    #[tokio::test]
    async fn test_other_hints_are_ignored() {
        let f = fixture();

        f.monitor
            .heartbeat("fury", Some(LivenessStatus::Blocked))
            .await
            .unwrap();
        assert_eq!(
            f.monitor.record("fury").await.unwrap().status,
            LivenessStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_staleness_and_recovery() {
        let f = fixture();
        let threshold = Duration::from_secs(90);

        f.monitor
            .heartbeat("garion", Some(LivenessStatus::Active))
            .await
            .unwrap();
        f.monitor.heartbeat("silk", None).await.unwrap();

        f.clock.advance(chrono::Duration::seconds(60));
        f.monitor.heartbeat("silk", None).await.unwrap();
        assert!(f.monitor.check_staleness(threshold).await.unwrap().is_empty());

        f.clock.advance(chrono::Duration::seconds(45));
        let offline = f.monitor.check_staleness(threshold).await.unwrap();
        assert_eq!(offline, vec!["garion".to_string()]);

        let garion = f.monitor.record("garion").await.unwrap();
        assert!(!garion.is_online);
        assert_eq!(garion.status, LivenessStatus::Offline);
        assert!(f.monitor.record("silk").await.unwrap().is_online);

        // Sweeping again changes nothing.
        assert!(f.monitor.check_staleness(threshold).await.unwrap().is_empty());

        f.monitor.heartbeat("garion", None).await.unwrap();
        let garion = f.monitor.record("garion").await.unwrap();
        assert!(garion.is_online);
        assert_eq!(garion.status, LivenessStatus::Idle);
    }

    #[tokio::test]
    async fn test_staleness_records_activity() {
        let f = fixture();
        f.monitor.heartbeat("barak", None).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(5));

        f.monitor
            .check_staleness(DEFAULT_STALENESS_THRESHOLD)
            .await
            .unwrap();

        let events = f
            .store
            .list_activities(&ActivityFilter::default())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "agent_offline");
        assert_eq!(events[0].metadata["agentId"], "barak");
    }

    #[tokio::test]
    async fn test_unknown_agent_heartbeat() {
        let f = fixture();
        let err = f.monitor.heartbeat("zedar", None).await.unwrap_err();
        assert!(matches!(err, DroverError::UnknownAgent(_)));
    }

    #[tokio::test]
    async fn test_store_failure_surfaces() {
        let monitor = LivenessMonitor::new(
            Arc::new(AgentRegistry::builtin().unwrap()),
            Arc::new(BrokenStore),
            Arc::new(ManualClock::new(Utc::now())),
            ActivityLog::new(Arc::new(BrokenStore)),
        );
        let err = monitor.heartbeat("fury", None).await.unwrap_err();
        assert!(matches!(err, DroverError::Storage(_)));
    }

    #[tokio::test]
    async fn test_snapshot_includes_unseen_agents() {
        let f = fixture();
        f.monitor.heartbeat("fury", None).await.unwrap();

        let snapshot = f.monitor.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 5);
        let online: Vec<_> = snapshot.iter().filter(|r| r.is_online).collect();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].agent_id, "fury");
    }
}
