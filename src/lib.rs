pub mod activity;
pub mod aggregator;
pub mod api;
pub mod clock;
pub mod config;
pub mod definitions;
pub mod error;
pub mod escalation;
pub mod ledger;
pub mod liveness;
pub mod logging;
pub mod spawner;
pub mod storage;
pub mod sweeper;
pub mod types;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{DroverError, Result};
pub use types::*;
