//! Periodic maintenance: staleness detection and the daily budget reset.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use crate::ledger::CostLedger;
use crate::liveness::LivenessMonitor;
use crate::types::AgentId;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub went_offline: Vec<AgentId>,
    pub budgets_reset: bool,
}

pub struct Sweeper {
    liveness: LivenessMonitor,
    ledger: Arc<CostLedger>,
    staleness_threshold: Duration,
    interval: Duration,
    in_flight: Mutex<()>,
}

impl Sweeper {
    pub fn new(
        liveness: LivenessMonitor,
        ledger: Arc<CostLedger>,
        staleness_threshold: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            liveness,
            ledger,
            staleness_threshold,
            interval,
            in_flight: Mutex::new(()),
        }
    }

    /// Runs one sweep, or returns `None` if another sweep is still going.
    pub async fn sweep_once(&self) -> Option<SweepReport> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            log::debug!("Previous sweep still running; skipping tick");
            return None;
        };

        let went_offline = match self.liveness.check_staleness(self.staleness_threshold).await {
            Ok(agents) => agents,
            Err(e) => {
                log::warn!("Staleness check failed: {}", e);
                Vec::new()
            }
        };
        let budgets_reset = self.ledger.reset_daily();

        Some(SweepReport {
            went_offline,
            budgets_reset,
        })
    }

    /// Sweeps on every tick until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        log::info!(
            "Sweeper running every {:?} (staleness threshold {:?})",
            self.interval,
            self.staleness_threshold
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Sweeps run detached so a slow store never delays the
                    // next tick; overlapping ones skip themselves.
                    let sweeper = self.clone();
                    tokio::spawn(async move {
                        if let Some(report) = sweeper.sweep_once().await {
                            if !report.went_offline.is_empty() || report.budgets_reset {
                                log::info!(
                                    "Sweep: {} agent(s) offline, budgets reset: {}",
                                    report.went_offline.len(),
                                    report.budgets_reset
                                );
                            }
                        }
                    });
                }
                _ = shutdown.changed() => {
                    log::info!("Sweeper stopping");
                    break;
                }
            }
        }
    }
}
