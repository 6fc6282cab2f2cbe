//! Per-agent daily spend counters.
//!
//! One counter per agent, each behind its own lock, so budget checks for
//! different agents never contend and same-agent updates are increments under
//! that agent's lock rather than read-then-write by the caller.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::{local_day, Clock};
use crate::definitions::AgentRegistry;
use crate::error::{DroverError, Result};
use crate::types::{ActivityCategory, ActivityEvent, AgentId};

#[derive(Debug)]
struct DailyCounter {
    day: NaiveDate,
    spent: Decimal,
}

impl DailyCounter {
    fn roll_to(&mut self, today: NaiveDate) {
        if self.day != today {
            self.day = today;
            self.spent = Decimal::ZERO;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    pub agent_id: AgentId,
    pub daily_budget: Decimal,
    pub spent_today: Decimal,
    pub remaining: Decimal,
}

pub struct CostLedger {
    registry: Arc<AgentRegistry>,
    clock: Arc<dyn Clock>,
    counters: HashMap<AgentId, Mutex<DailyCounter>>,
    last_reset: Mutex<NaiveDate>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CostLedger {
    pub fn new(registry: Arc<AgentRegistry>, clock: Arc<dyn Clock>) -> Self {
        let today = clock.today();
        let counters = registry
            .iter()
            .map(|agent| {
                (
                    agent.id.clone(),
                    Mutex::new(DailyCounter {
                        day: today,
                        spent: Decimal::ZERO,
                    }),
                )
            })
            .collect();

        Self {
            registry,
            clock,
            counters,
            last_reset: Mutex::new(today),
        }
    }

    fn counter(&self, agent_id: &str) -> Result<&Mutex<DailyCounter>> {
        self.counters
            .get(agent_id)
            .ok_or_else(|| DroverError::UnknownAgent(agent_id.to_string()))
    }

    fn daily_budget(&self, agent_id: &str) -> Result<Decimal> {
        Ok(self.registry.get(agent_id)?.cost_profile.daily_budget)
    }

    /// Loads today's totals from already-recorded `agent/spawn` events.
    /// Returns the number of events applied.
    pub fn init_from_events(&self, events: &[ActivityEvent]) -> usize {
        let today = self.clock.today();
        let mut applied = 0;

        for event in events {
            if !event.is(ActivityCategory::Agent, "spawn") || local_day(event.timestamp) != today {
                continue;
            }
            let Some(counter) = self.counters.get(&event.actor) else {
                continue;
            };
            let mut counter = lock(counter);
            counter.roll_to(today);
            counter.spent = counter.spent.saturating_add(event.cost_or_zero());
            applied += 1;
        }

        if applied > 0 {
            log::info!("Ledger restored {} spawn charges for {}", applied, today);
        }
        applied
    }

    /// Adds `amount` to today's total and returns the new total.
    pub fn spend(&self, agent_id: &str, amount: Decimal) -> Result<Decimal> {
        let counter = self.counter(agent_id)?;
        let today = self.clock.today();

        let mut counter = lock(counter);
        counter.roll_to(today);
        counter.spent += amount.max(Decimal::ZERO);
        Ok(counter.spent)
    }

    /// Check and charge under one lock acquisition. Returns the remaining
    /// budget after the charge.
    pub fn try_spend(&self, agent_id: &str, amount: Decimal) -> Result<Decimal> {
        let budget = self.daily_budget(agent_id)?;
        let counter = self.counter(agent_id)?;
        let today = self.clock.today();

        let mut counter = lock(counter);
        counter.roll_to(today);
        let remaining = (budget - counter.spent).max(Decimal::ZERO);
        if remaining < amount {
            return Err(DroverError::BudgetExceeded {
                agent_id: agent_id.to_string(),
                requested: amount,
                remaining,
            });
        }
        counter.spent += amount.max(Decimal::ZERO);
        Ok((budget - counter.spent).max(Decimal::ZERO))
    }

    /// Hands back a charge made on `charged_on` whose work was never
    /// recorded. A charge from an earlier day left with that day's counter.
    pub(crate) fn release(
        &self,
        agent_id: &str,
        amount: Decimal,
        charged_on: NaiveDate,
    ) -> Result<()> {
        let counter = self.counter(agent_id)?;
        let mut counter = lock(counter);
        counter.roll_to(self.clock.today());
        if counter.day == charged_on {
            counter.spent = (counter.spent - amount).max(Decimal::ZERO);
        }
        Ok(())
    }

    pub fn spent_today(&self, agent_id: &str) -> Result<Decimal> {
        let counter = self.counter(agent_id)?;
        let today = self.clock.today();

        let counter = lock(counter);
        if counter.day != today {
            return Ok(Decimal::ZERO);
        }
        Ok(counter.spent)
    }

    pub fn remaining_budget(&self, agent_id: &str) -> Result<Decimal> {
        let budget = self.daily_budget(agent_id)?;
        let spent = self.spent_today(agent_id)?;
        Ok((budget - spent).max(Decimal::ZERO))
    }

    pub fn has_budget(&self, agent_id: &str, amount: Decimal) -> Result<bool> {
        Ok(self.remaining_budget(agent_id)? >= amount)
    }

    /// Clears every counter at most once per local day. Returns `true` when
    /// this call performed the reset.
    pub fn reset_daily(&self) -> bool {
        let today = self.clock.today();
        let mut last_reset = lock(&self.last_reset);
        if *last_reset == today {
            return false;
        }

        // Counters already on today hold post-midnight charges and stay.
        for counter in self.counters.values() {
            lock(counter).roll_to(today);
        }
        log::info!("Daily budgets reset for {} (previous {})", today, *last_reset);
        *last_reset = today;
        true
    }

    pub fn snapshot(&self) -> Vec<BudgetStatus> {
        self.registry
            .iter()
            .filter_map(|agent| {
                let spent_today = self.spent_today(&agent.id).ok()?;
                let daily_budget = agent.cost_profile.daily_budget;
                Some(BudgetStatus {
                    agent_id: agent.id.clone(),
                    daily_budget,
                    spent_today,
                    remaining: (daily_budget - spent_today).max(Decimal::ZERO),
                })
            })
            .collect()
    }

    /// Nothing is buffered; the final totals go to the log.
    pub fn teardown(&self) {
        for status in self.snapshot() {
            log::info!(
                "Ledger close: {} spent {} of {}",
                status.agent_id,
                status.spent_today,
                status.daily_budget
            );
        }
    }
}
