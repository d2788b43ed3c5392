//! Rolling record of unit restarts, used to bound how often the relay may
//! restart itself.

use std::{collections::VecDeque, time::Duration};

use chrono::{DateTime, Utc};
use conduit_common::clock;

/// Restarts older than this no longer count against the budget
pub const WINDOW: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRecord {
    pub at: DateTime<Utc>,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct RestartWindow {
    records: VecDeque<RestartRecord>,
    budget: usize,
    window: Duration,
}

impl RestartWindow {
    pub const fn new(budget: usize) -> Self {
        Self {
            records: VecDeque::new(),
            budget,
            window: WINDOW,
        }
    }

    #[must_use]
    pub const fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub const fn budget(&self) -> usize {
        self.budget
    }

    /// Record a failure at `at`.
    ///
    /// Returns `false` once the failures inside the window exceed the budget,
    /// meaning the caller must give up rather than restart.
    pub fn record(&mut self, at: DateTime<Utc>, error: impl Into<String>) -> bool {
        self.prune(at);
        self.records.push_back(RestartRecord {
            at,
            error: error.into(),
        });

        self.records.len() <= self.budget
    }

    /// Drop records that have aged out of the window as of `now`
    pub fn prune(&mut self, now: DateTime<Utc>) {
        while self
            .records
            .front()
            .is_some_and(|record| clock::elapsed(record.at, now) >= self.window)
        {
            self.records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &RestartRecord> {
        self.records.iter()
    }
}
