//! Live cost rollups over the activity stream.
//!
//! The rollup is a pure fold over cost samples; the background task only keeps
//! the sample set current by draining the store's change feed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::clock::{Clock, Windows};
use crate::storage::{ActivityFilter, Store, StoreChange};
use crate::types::{ActivityEvent, AgentId, EventId};

/// How often rollups are recomputed without new events, so window edges
/// (midnight, Monday, the 1st) move on their own.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// The part of an activity event the rollups need.
#[derive(Debug, Clone, PartialEq)]
pub struct CostSample {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub agent: AgentId,
    pub area: Option<String>,
    pub cost: Decimal,
}

impl From<&ActivityEvent> for CostSample {
    fn from(event: &ActivityEvent) -> Self {
        Self {
            id: event.id,
            timestamp: event.timestamp,
            agent: event.actor.clone(),
            area: event.area().map(str::to_string),
            cost: event.cost_or_zero(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostRollup {
    pub today_cost: Decimal,
    pub week_cost: Decimal,
    pub month_cost: Decimal,
    /// Month-to-date per actor.
    pub cost_by_agent: BTreeMap<AgentId, Decimal>,
    /// Month-to-date per area; events without an area are left out.
    pub cost_by_area: BTreeMap<String, Decimal>,
    pub computed_at: DateTime<Utc>,
}

impl CostRollup {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            today_cost: Decimal::ZERO,
            week_cost: Decimal::ZERO,
            month_cost: Decimal::ZERO,
            cost_by_agent: BTreeMap::new(),
            cost_by_area: BTreeMap::new(),
            computed_at: now,
        }
    }

    pub fn fold<'a>(samples: impl IntoIterator<Item = &'a CostSample>, now: DateTime<Utc>) -> Self {
        let windows = Windows::at(now);
        let mut rollup = Self::empty(now);

        for sample in samples {
            if sample.cost.is_zero() {
                continue;
            }
            if !rollup.add(sample, &windows) {
                log::warn!(
                    "Skipping cost sample {} from {}: {} overflows the rollup",
                    sample.id,
                    sample.agent,
                    sample.cost
                );
            }
        }

        rollup
    }

    /// Adds one sample to every window it falls in, or to none of them when
    /// any total would overflow.
    fn add(&mut self, sample: &CostSample, windows: &Windows) -> bool {
        let cost = sample.cost;
        let in_month = sample.timestamp >= windows.month;
        let bump = |total: Decimal, included: bool| {
            if included {
                total.checked_add(cost)
            } else {
                Some(total)
            }
        };

        let agent_total = self.cost_by_agent.get(&sample.agent).copied();
        let area_total = sample
            .area
            .as_ref()
            .map(|area| self.cost_by_area.get(area).copied().unwrap_or(Decimal::ZERO));

        let (Some(today), Some(week), Some(month), Some(agent), Some(area)) = (
            bump(self.today_cost, sample.timestamp >= windows.today),
            bump(self.week_cost, sample.timestamp >= windows.week),
            bump(self.month_cost, in_month),
            bump(agent_total.unwrap_or(Decimal::ZERO), in_month),
            match area_total {
                Some(total) => bump(total, in_month).map(Some),
                None => Some(None),
            },
        ) else {
            return false;
        };

        self.today_cost = today;
        self.week_cost = week;
        self.month_cost = month;
        if in_month {
            self.cost_by_agent.insert(sample.agent.clone(), agent);
            if let (Some(name), Some(total)) = (&sample.area, area) {
                self.cost_by_area.insert(name.clone(), total);
            }
        }
        true
    }
}

type SampleSet = Arc<RwLock<HashMap<EventId, CostSample>>>;

/// Read side of a running aggregator.
#[derive(Clone)]
pub struct AggregatorHandle {
    samples: SampleSet,
    clock: Arc<dyn Clock>,
    rollup: watch::Receiver<CostRollup>,
}

impl AggregatorHandle {
    /// Rollup with windows evaluated at the current time.
    pub fn current(&self) -> CostRollup {
        let samples = self.samples.read().unwrap_or_else(PoisonError::into_inner);
        CostRollup::fold(samples.values(), self.clock.now())
    }

    /// The most recently published rollup.
    pub fn latest(&self) -> CostRollup {
        self.rollup.borrow().clone()
    }

    /// Receives a new rollup after every batch of changes.
    pub fn subscribe(&self) -> watch::Receiver<CostRollup> {
        self.rollup.clone()
    }
}

pub struct CostAggregator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    samples: SampleSet,
    rollup: watch::Sender<CostRollup>,
    refresh_interval: Duration,
}

impl CostAggregator {
    /// Starts the aggregation task. It runs until `shutdown` flips or the
    /// store's change feed closes.
    pub fn spawn(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
    ) -> (AggregatorHandle, JoinHandle<()>) {
        Self::spawn_with_interval(store, clock, shutdown, DEFAULT_REFRESH_INTERVAL)
    }

    pub fn spawn_with_interval(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        shutdown: watch::Receiver<bool>,
        refresh_interval: Duration,
    ) -> (AggregatorHandle, JoinHandle<()>) {
        // Subscribe before the initial load so nothing written in between is
        // missed; duplicates are collapsed by event id.
        let changes = store.subscribe();
        let (tx, rx) = watch::channel(CostRollup::empty(clock.now()));
        let samples: SampleSet = Arc::new(RwLock::new(HashMap::new()));

        let handle = AggregatorHandle {
            samples: samples.clone(),
            clock: clock.clone(),
            rollup: rx,
        };
        let aggregator = Self {
            store,
            clock,
            samples,
            rollup: tx,
            refresh_interval,
        };

        let task = tokio::spawn(aggregator.run(changes, shutdown));
        (handle, task)
    }

    async fn run(
        self,
        mut changes: broadcast::Receiver<StoreChange>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.resync().await;
        self.publish();

        let mut refresh = tokio::time::interval(self.refresh_interval);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    log::debug!("Cost aggregator stopping");
                    break;
                }
                received = changes.recv() => {
                    match received {
                        Ok(change) => {
                            self.absorb(change);
                            self.drain(&mut changes).await;
                        }
                        Err(RecvError::Lagged(missed)) => {
                            log::warn!("Cost aggregator lagged by {} changes; reloading", missed);
                            self.resync().await;
                        }
                        Err(RecvError::Closed) => {
                            log::info!("Store change feed closed; cost aggregator stopping");
                            break;
                        }
                    }
                    self.publish();
                }
                _ = refresh.tick() => {
                    self.prune();
                    self.publish();
                }
            }
        }
    }

    /// Takes everything already queued so one burst yields one recompute.
    async fn drain(&self, changes: &mut broadcast::Receiver<StoreChange>) {
        loop {
            match changes.try_recv() {
                Ok(change) => self.absorb(change),
                Err(TryRecvError::Lagged(missed)) => {
                    log::warn!("Cost aggregator lagged by {} changes; reloading", missed);
                    self.resync().await;
                }
                Err(_) => break,
            }
        }
    }

    fn absorb(&self, change: StoreChange) {
        let StoreChange::Activity(event) = change else {
            return;
        };
        if event.timestamp < Windows::at(self.clock.now()).earliest() {
            return;
        }
        let sample = CostSample::from(&event);
        self.samples
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sample.id, sample);
    }

    async fn resync(&self) {
        let since = Windows::at(self.clock.now()).earliest();
        match self.store.list_activities(&ActivityFilter::since(since)).await {
            Ok(events) => {
                let loaded: HashMap<_, _> = events
                    .iter()
                    .map(|e| (e.id, CostSample::from(e)))
                    .collect();
                log::debug!("Cost aggregator loaded {} events since {}", loaded.len(), since);
                *self.samples.write().unwrap_or_else(PoisonError::into_inner) = loaded;
            }
            // Keep serving the last known samples; the next lag or restart retries.
            Err(e) => log::warn!("Cost aggregator failed to load activities: {}", e),
        }
    }

    fn prune(&self) {
        let cutoff = Windows::at(self.clock.now()).earliest();
        self.samples
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, s| s.timestamp >= cutoff);
    }

    fn publish(&self) {
        let rollup = {
            let samples = self.samples.read().unwrap_or_else(PoisonError::into_inner);
            CostRollup::fold(samples.values(), self.clock.now())
        };
        self.rollup.send_replace(rollup);
    }
}
