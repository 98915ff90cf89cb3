//! Rolling-window auto-restart budget.
//!
//! Grounded on the rolling-window accounting a restart policy needs: keep a
//! small ring of recent restart timestamps and count how many fall inside
//! the trailing window, rather than tracking a decaying counter that would
//! need its own expiry timer.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Tracks restart attempts within a rolling window and decides whether
/// another automatic restart is allowed.
#[derive(Debug, Clone)]
pub struct RestartBudget {
    max_restarts: u32,
    window: ChronoDuration,
    history: Vec<DateTime<Utc>>,
}

impl RestartBudget {
    /// Construct a budget allowing `max_restarts` attempts within `window`.
    #[must_use]
    pub fn new(max_restarts: u32, window: std::time::Duration) -> Self {
        Self {
            max_restarts,
            window: ChronoDuration::from_std(window).unwrap_or(ChronoDuration::minutes(5)),
            history: Vec::new(),
        }
    }

    /// Seed the budget from persisted restart history (e.g. on resume after
    /// a process restart, so the budget survives the server's own restart).
    pub fn seed(&mut self, history: Vec<DateTime<Utc>>) {
        self.history = history;
    }

    /// How many restarts have occurred within the window ending at `now`.
    #[must_use]
    pub fn count_within_window(&self, now: DateTime<Utc>) -> u32 {
        let cutoff = now - self.window;
        u32::try_from(self.history.iter().filter(|ts| **ts >= cutoff).count()).unwrap_or(u32::MAX)
    }

    /// Whether another automatic restart is allowed right now.
    #[must_use]
    pub fn allows_restart(&self, now: DateTime<Utc>) -> bool {
        self.count_within_window(now) < self.max_restarts
    }

    /// Record a restart attempt at `now`. Callers should check
    /// [`allows_restart`](Self::allows_restart) first; this does not enforce
    /// the budget itself, it only records history.
    pub fn record(&mut self, now: DateTime<Utc>) {
        self.history.push(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_restarts_up_to_budget_then_denies() {
        let mut budget = RestartBudget::new(3, std::time::Duration::from_secs(300));
        let t0 = Utc::now();

        for i in 0..3 {
            let now = t0 + ChronoDuration::seconds(i * 5);
            assert!(budget.allows_restart(now), "attempt {i} should be allowed");
            budget.record(now);
        }

        let fourth = t0 + ChronoDuration::seconds(20);
        assert!(!budget.allows_restart(fourth), "fourth attempt within the window must be denied");
    }

    #[test]
    fn old_restarts_age_out_of_the_window() {
        let mut budget = RestartBudget::new(1, std::time::Duration::from_secs(60));
        let t0 = Utc::now();
        budget.record(t0);
        assert!(!budget.allows_restart(t0 + ChronoDuration::seconds(30)));
        assert!(budget.allows_restart(t0 + ChronoDuration::seconds(90)), "restart should age out past the window");
    }
}
