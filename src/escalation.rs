use std::sync::Arc;

use crate::definitions::AgentRegistry;
use crate::error::Result;
use crate::types::{AgentId, EscalationTrigger};

/// Single decision point for routing work to the controller.
#[derive(Debug, Clone)]
pub struct EscalationEvaluator {
    registry: Arc<AgentRegistry>,
}

impl EscalationEvaluator {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    /// The controller never escalates; everyone else escalates exactly on the
    /// triggers they declare.
    pub fn should_escalate(&self, agent_id: &str, trigger: EscalationTrigger) -> Result<bool> {
        let agent = self.registry.get(agent_id)?;
        if agent.controller {
            return Ok(false);
        }
        Ok(agent.escalation_triggers.contains(&trigger))
    }

    /// Same as [`should_escalate`](Self::should_escalate) for a trigger given by
    /// name. Unrecognised names are an error, never a silent `false`.
    pub fn should_escalate_named(&self, agent_id: &str, trigger: &str) -> Result<bool> {
        let trigger: EscalationTrigger = trigger.parse()?;
        self.should_escalate(agent_id, trigger)
    }

    pub fn escalation_target(&self) -> AgentId {
        self.registry.controller().id.clone()
    }
}
