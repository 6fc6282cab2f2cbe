use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use super::builtin::builtin_roster;
use super::schema::{AgentDefinition, Roster};
use crate::error::{DroverError, Result};
use crate::types::Capability;

/// Immutable catalogue of agent definitions, validated on construction.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: Vec<AgentDefinition>,
    index: HashMap<String, usize>,
    controller: usize,
}

impl AgentRegistry {
    pub fn from_definitions(agents: Vec<AgentDefinition>) -> Result<Self> {
        if agents.is_empty() {
            return Err(DroverError::Config("agent roster is empty".to_string()));
        }

        let mut index = HashMap::with_capacity(agents.len());
        for (i, agent) in agents.iter().enumerate() {
            if agent.id.trim().is_empty() {
                return Err(DroverError::Config(format!(
                    "agent at position {} has an empty id",
                    i
                )));
            }
            if agent.id == crate::types::SYSTEM_ACTOR {
                return Err(DroverError::Config(format!(
                    "agent id '{}' is reserved",
                    agent.id
                )));
            }
            if index.insert(agent.id.clone(), i).is_some() {
                return Err(DroverError::Config(format!(
                    "duplicate agent id '{}'",
                    agent.id
                )));
            }

            let profile = &agent.cost_profile;
            if profile.estimated_cost_per_1k_tokens < Decimal::ZERO
                || profile.daily_budget < Decimal::ZERO
            {
                return Err(DroverError::Config(format!(
                    "agent '{}' has a negative cost profile",
                    agent.id
                )));
            }
        }

        let controllers: Vec<usize> = agents
            .iter()
            .enumerate()
            .filter(|(_, a)| a.controller)
            .map(|(i, _)| i)
            .collect();

        let controller = match controllers.as_slice() {
            [only] => *only,
            [] => {
                return Err(DroverError::Config(
                    "roster has no controller agent".to_string(),
                ))
            }
            _ => {
                return Err(DroverError::Config(format!(
                    "roster has {} controller agents, expected exactly one",
                    controllers.len()
                )))
            }
        };

        if !agents[controller].escalation_triggers.is_empty() {
            return Err(DroverError::Config(format!(
                "controller '{}' must not declare escalation triggers",
                agents[controller].id
            )));
        }

        Ok(Self {
            agents,
            index,
            controller,
        })
    }

    pub fn builtin() -> Result<Self> {
        Self::from_definitions(builtin_roster())
    }

    pub fn load_yaml(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DroverError::Config(format!("failed to read roster {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let roster: Roster = serde_yaml::from_str(content)
            .map_err(|e| DroverError::Config(format!("failed to parse roster: {}", e)))?;
        Self::from_definitions(roster.agents)
    }

    pub fn get(&self, agent_id: &str) -> Result<&AgentDefinition> {
        self.index
            .get(agent_id)
            .map(|&i| &self.agents[i])
            .ok_or_else(|| DroverError::UnknownAgent(agent_id.to_string()))
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.index.contains_key(agent_id)
    }

    pub fn controller(&self) -> &AgentDefinition {
        &self.agents[self.controller]
    }

    pub fn is_controller(&self, agent_id: &str) -> bool {
        self.controller().id == agent_id
    }

    /// `(tokens / 1000) * rate`, in exact decimal arithmetic.
    pub fn estimate_cost(&self, agent_id: &str, tokens: u64) -> Result<Decimal> {
        let agent = self.get(agent_id)?;
        let thousands = Decimal::from(tokens) / Decimal::ONE_THOUSAND;
        Ok((thousands * agent.cost_profile.estimated_cost_per_1k_tokens).normalize())
    }

    /// The controller holds every capability.
    pub fn can(&self, agent_id: &str, capability: Capability) -> Result<bool> {
        let agent = self.get(agent_id)?;
        Ok(agent.controller || agent.capabilities.contains(&capability))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentDefinition> {
        self.agents.iter()
    }

    pub fn ids(&self) -> HashSet<&str> {
        self.agents.iter().map(|a| a.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
