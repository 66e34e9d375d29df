//! Sliding-window call budget.
//!
//! Two windows, both must have headroom before a call is admitted. The
//! ledger is single-writer (the extractor task) and never blocks — a denial
//! returns how long to wait for the earliest slot to free.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Both windows checked; wait this long before asking again.
    Deferred(Duration),
}

#[derive(Debug)]
pub struct BudgetLedger {
    minute_cap: usize,
    hourly_cap: usize,
    minute: VecDeque<Instant>,
    hourly: VecDeque<Instant>,
}

impl BudgetLedger {
    pub fn new(hourly_cap: u32, minute_cap: u32) -> Self {
        Self {
            minute_cap: minute_cap as usize,
            hourly_cap: hourly_cap as usize,
            minute: VecDeque::new(),
            hourly: VecDeque::new(),
        }
    }

    /// Check both windows at `now`. Does not consume a slot — call
    /// [`BudgetLedger::record`] once the call is actually issued.
    pub fn admit(&mut self, now: Instant) -> Admission {
        self.evict(now);

        let minute_full = self.minute.len() >= self.minute_cap;
        let hourly_full = self.hourly.len() >= self.hourly_cap;
        if !minute_full && !hourly_full {
            return Admission::Granted;
        }

        let mut wait = Duration::ZERO;
        if minute_full {
            if let Some(&oldest) = self.minute.front() {
                wait = wait.max((oldest + MINUTE).saturating_duration_since(now));
            }
        }
        if hourly_full {
            if let Some(&oldest) = self.hourly.front() {
                wait = wait.max((oldest + HOUR).saturating_duration_since(now));
            }
        }
        // Guard against a zero wait from clock granularity.
        Admission::Deferred(wait.max(Duration::from_millis(100)))
    }

    /// Record an issued call in both windows.
    pub fn record(&mut self, now: Instant) {
        self.minute.push_back(now);
        self.hourly.push_back(now);
    }

    pub fn in_flight_minute(&self) -> usize {
        self.minute.len()
    }

    pub fn in_flight_hour(&self) -> usize {
        self.hourly.len()
    }

    fn evict(&mut self, now: Instant) {
        while self
            .minute
            .front()
            .is_some_and(|&t| now.duration_since(t) >= MINUTE)
        {
            self.minute.pop_front();
        }
        while self
            .hourly
            .front()
            .is_some_and(|&t| now.duration_since(t) >= HOUR)
        {
            self.hourly.pop_front();
        }
    }
}
