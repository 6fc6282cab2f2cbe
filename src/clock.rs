//! Time source and calendar windows.
//!
//! Every day boundary in the crate is local midnight. The ledger's daily reset
//! and the aggregator's `today`/`week`/`month` windows both go through
//! [`local_day`] and [`Windows`], so enforcement and rollups agree on what
//! "today" means.

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use std::sync::{Mutex, PoisonError};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        local_day(self.now())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The local calendar date an instant falls on.
pub fn local_day(ts: DateTime<Utc>) -> NaiveDate {
    ts.with_timezone(&Local).date_naive()
}

/// First instant of `date` in local time.
pub fn start_of_local_day(date: NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::default());
    match Local.from_local_datetime(&midnight).earliest() {
        Some(local) => local.with_timezone(&Utc),
        // Midnight skipped by a DST jump; the day starts at the first valid hour.
        None => (1..=3)
            .filter_map(|h| date.and_hms_opt(h, 0, 0))
            .find_map(|naive| Local.from_local_datetime(&naive).earliest())
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&midnight)),
    }
}

/// Start instants of the rollup windows containing `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Windows {
    pub today: DateTime<Utc>,
    /// Weeks start on Monday.
    pub week: DateTime<Utc>,
    pub month: DateTime<Utc>,
}

impl Windows {
    pub fn at(now: DateTime<Utc>) -> Self {
        let day = local_day(now);
        let week_start = day - Duration::days(i64::from(day.weekday().num_days_from_monday()));
        let month_start = day.with_day(1).unwrap_or(day);

        Self {
            today: start_of_local_day(day),
            week: start_of_local_day(week_start),
            month: start_of_local_day(month_start),
        }
    }

    /// Oldest instant any window still covers. A week can begin in the
    /// previous month.
    pub fn earliest(&self) -> DateTime<Utc> {
        self.week.min(self.month)
    }
}
