use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AgentId, LivenessStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentLivenessRecord {
    pub agent_id: AgentId,
    pub status: LivenessStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub is_online: bool,
    /// Bumped on every write; used for compare-and-set.
    #[serde(default)]
    pub revision: u64,
}

impl AgentLivenessRecord {
    /// Record for an agent that has never reported in.
    pub fn unseen(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            status: LivenessStatus::Offline,
            last_heartbeat: None,
            is_online: false,
            revision: 0,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        match self.last_heartbeat {
            Some(last) => now.signed_duration_since(last) > threshold,
            None => true,
        }
    }
}
