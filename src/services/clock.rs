//! Source of "today" for lending decisions

use std::sync::atomic::{AtomicI32, Ordering};

use chrono::{Datelike, Days, Local, NaiveDate};

pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Server-local calendar date
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Settable date, for tests and replays
#[derive(Debug)]
pub struct FixedClock {
    days_from_ce: AtomicI32,
}

impl FixedClock {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            days_from_ce: AtomicI32::new(date.num_days_from_ce()),
        }
    }

    pub fn set(&self, date: NaiveDate) {
        self.days_from_ce.store(date.num_days_from_ce(), Ordering::SeqCst);
    }

    pub fn advance(&self, days: u64) {
        let next = self
            .today()
            .checked_add_days(Days::new(days))
            .unwrap_or(NaiveDate::MAX);
        self.set(next);
    }
}

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        NaiveDate::from_num_days_from_ce_opt(self.days_from_ce.load(Ordering::SeqCst))
            .unwrap_or(NaiveDate::MAX)
    }
}
