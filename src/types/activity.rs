use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ActivityCategory, ActorType, EventId};

/// Actor name used for events the orchestrator emits on its own behalf.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub actor_type: ActorType,
    pub category: ActivityCategory,
    pub action: String,
    pub description: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub cost: Option<Decimal>,
}

impl ActivityEvent {
    pub fn new(
        actor: impl Into<String>,
        actor_type: ActorType,
        category: ActivityCategory,
        action: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: EventId::new_v4(),
            timestamp: Utc::now(),
            actor: actor.into(),
            actor_type,
            category,
            action: action.into(),
            description: description.into(),
            metadata: Map::new(),
            cost: None,
        }
    }

    pub fn system(
        category: ActivityCategory,
        action: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self::new(SYSTEM_ACTOR, ActorType::System, category, action, description)
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_cost(mut self, cost: Decimal) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_area(self, area: impl Into<String>) -> Self {
        self.with_metadata("area", area.into())
    }

    pub fn area(&self) -> Option<&str> {
        self.metadata.get("area").and_then(Value::as_str)
    }

    /// Events without a cost count as zero.
    pub fn cost_or_zero(&self) -> Decimal {
        self.cost.unwrap_or(Decimal::ZERO)
    }

    pub fn is(&self, category: ActivityCategory, action: &str) -> bool {
        self.category == category && self.action == action
    }
}
