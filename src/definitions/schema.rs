use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::types::{ActorType, AgentId, Capability, EscalationTrigger};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub id: AgentId,
    pub display_name: String,
    pub role: String,

    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    pub cost_profile: CostProfile,
    #[serde(default)]
    pub escalation_triggers: BTreeSet<EscalationTrigger>,

    // Exactly one controller per roster; it takes escalated work.
    #[serde(default)]
    pub controller: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostProfile {
    #[serde(rename = "estimatedCostPer1KTokens")]
    pub estimated_cost_per_1k_tokens: Decimal,
    pub daily_budget: Decimal,
}

impl AgentDefinition {
    pub fn actor_type(&self) -> ActorType {
        if self.controller {
            ActorType::Main
        } else {
            ActorType::Subagent
        }
    }
}

/// On-disk roster layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Roster {
    pub agents: Vec<AgentDefinition>,
}
