use rust_decimal_macros::dec;
use std::collections::BTreeSet;

use super::schema::{AgentDefinition, CostProfile};
use crate::types::{Capability, EscalationTrigger};

pub const CONTROLLER_ID: &str = "belgarath";

/// Default roster used when no roster file is configured.
pub fn builtin_roster() -> Vec<AgentDefinition> {
    vec![
        AgentDefinition {
            id: CONTROLLER_ID.to_string(),
            display_name: "Belgarath".to_string(),
            role: "controller".to_string(),
            capabilities: Capability::all().into_iter().collect(),
            cost_profile: CostProfile {
                estimated_cost_per_1k_tokens: dec!(0.075),
                daily_budget: dec!(50.00),
            },
            escalation_triggers: BTreeSet::new(),
            controller: true,
        },
        AgentDefinition {
            id: "fury".to_string(),
            display_name: "Fury".to_string(),
            role: "coding specialist".to_string(),
            capabilities: [Capability::Code, Capability::File, Capability::Review]
                .into_iter()
                .collect(),
            cost_profile: CostProfile {
                estimated_cost_per_1k_tokens: dec!(0.015),
                daily_budget: dec!(10.00),
            },
            escalation_triggers: [
                EscalationTrigger::CostExceeded,
                EscalationTrigger::ComplexReasoningNeeded,
            ]
            .into_iter()
            .collect(),
            controller: false,
        },
        AgentDefinition {
            id: "garion".to_string(),
            display_name: "Garion".to_string(),
            role: "research specialist".to_string(),
            capabilities: [Capability::Research, Capability::Web, Capability::Writing]
                .into_iter()
                .collect(),
            cost_profile: CostProfile {
                estimated_cost_per_1k_tokens: dec!(0.003),
                daily_budget: dec!(15.00),
            },
            escalation_triggers: [
                EscalationTrigger::CostExceeded,
                EscalationTrigger::UnclearTask,
            ]
            .into_iter()
            .collect(),
            controller: false,
        },
        AgentDefinition {
            id: "silk".to_string(),
            display_name: "Silk".to_string(),
            role: "communications".to_string(),
            capabilities: [Capability::Communication, Capability::Web]
                .into_iter()
                .collect(),
            cost_profile: CostProfile {
                estimated_cost_per_1k_tokens: dec!(0.003),
                daily_budget: dec!(8.00),
            },
            escalation_triggers: [EscalationTrigger::SafetyConcern].into_iter().collect(),
            controller: false,
        },
        AgentDefinition {
            id: "barak".to_string(),
            display_name: "Barak".to_string(),
            role: "reviewer".to_string(),
            capabilities: [Capability::Review, Capability::File].into_iter().collect(),
            cost_profile: CostProfile {
                estimated_cost_per_1k_tokens: dec!(0.015),
                daily_budget: dec!(12.00),
            },
            escalation_triggers: [
                EscalationTrigger::SafetyConcern,
                EscalationTrigger::UnclearTask,
            ]
            .into_iter()
            .collect(),
            controller: false,
        },
    ]
}
