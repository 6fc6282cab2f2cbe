pub mod builtin;
pub mod registry;
pub mod schema;

pub use builtin::{builtin_roster, CONTROLLER_ID};
pub use registry::AgentRegistry;
pub use schema::{AgentDefinition, CostProfile, Roster};
